//! Credential Store surface (§4.2, C2). The trait is defined here so both
//! `gproxy-provider-impl` (which consumes it from inside each adapter) and
//! `gproxy-core` (which implements it against the filesystem) can depend
//! on a shared contract without a crate cycle.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::errors::ProviderResult;

/// One OAuth account slot per provider. `Secondary` exists purely to allow
/// automatic failover when the primary account is rate-limited (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountSlot {
    Primary,
    Secondary,
}

impl AccountSlot {
    pub fn file_suffix(&self) -> &'static str {
        match self {
            AccountSlot::Primary => "",
            AccountSlot::Secondary => "-2",
        }
    }
}

/// Persisted per-provider, per-account OAuth token record (§3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthTokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Provider-specific extras (plan, workspace/project id, account id);
    /// kept as a free-form map rather than named fields so each provider
    /// can grow its own without touching this shared type.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub extra: JsonValue,
}

impl OAuthTokenRecord {
    /// Invariant 3 (§3): every outbound call carries a token whose expiry
    /// is at least 5 minutes in the future.
    pub fn needs_refresh(&self, now_millis: i64) -> bool {
        const FIVE_MINUTES_MS: i64 = 5 * 60 * 1000;
        self.expires_at - now_millis < FIVE_MINUTES_MS
    }

    pub fn extra_str(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// A plain API key or upstream base-url override from the dotenv
    /// config. Returns `None` when the key is absent (not an error: the
    /// caller decides whether the key is required).
    fn get_env(&self, key: &str) -> Option<String>;

    async fn load_oauth_tokens(
        &self,
        provider: &str,
        slot: AccountSlot,
    ) -> ProviderResult<Option<OAuthTokenRecord>>;

    async fn save_oauth_tokens(
        &self,
        provider: &str,
        slot: AccountSlot,
        record: OAuthTokenRecord,
    ) -> ProviderResult<()>;

    async fn delete_oauth_tokens(&self, provider: &str, slot: AccountSlot) -> ProviderResult<()>;
}

/// A local, unsigned decode of the base64url middle segment of a JWT.
/// Claims are advisory hints only (§4.2) — no signature check is made or
/// implied.
pub fn decode_jwt_claims(token: &str) -> Option<JsonValue> {
    let middle = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(middle).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_refresh_when_within_five_minutes() {
        let record = OAuthTokenRecord {
            expires_at: 1_000_000 + 60_000,
            ..Default::default()
        };
        assert!(record.needs_refresh(1_000_000));
    }

    #[test]
    fn does_not_need_refresh_with_plenty_of_runway() {
        let record = OAuthTokenRecord {
            expires_at: 1_000_000 + 10 * 60 * 1000,
            ..Default::default()
        };
        assert!(!record.needs_refresh(1_000_000));
    }

    #[test]
    fn decodes_unsigned_jwt_payload() {
        // header.payload.signature, payload = {"email":"a@b.com"} base64url, no padding
        let payload = URL_SAFE_NO_PAD.encode(br#"{"email":"a@b.com","exp":123}"#);
        let token = format!("header.{payload}.sig");
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims["email"], "a@b.com");
        assert_eq!(claims["exp"], 123);
    }
}
