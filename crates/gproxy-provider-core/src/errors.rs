use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Required API key or OAuth token absent (§7 `CredentialMissing`).
    CredentialMissing(String),
    /// Stored OAuth token is expired and refresh failed (§7 `CredentialExpired`).
    CredentialExpired(String),
    /// Non-2xx from upstream, carrying its status and a truncated body (§7 `UpstreamRejected`).
    UpstreamRejected { status: u16, message: String },
    /// Malformed upstream event; the adapter logs and skips it (§7 `UpstreamBadStream`).
    UpstreamBadStream(String),
    /// Missing environment for a required default (§7 `ConfigError`).
    Config(String),
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::CredentialMissing(what) => write!(f, "missing credential: {what}"),
            ProviderError::CredentialExpired(what) => write!(f, "credential expired: {what}"),
            ProviderError::UpstreamRejected { status, message } => {
                write!(f, "upstream rejected ({status}): {message}")
            }
            ProviderError::UpstreamBadStream(message) => write!(f, "bad upstream event: {message}"),
            ProviderError::Config(message) => write!(f, "config error: {message}"),
            ProviderError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ProviderError {}
