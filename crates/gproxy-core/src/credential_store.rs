//! Filesystem-backed `CredentialStore` (§4.2, C2): API keys/base-urls from
//! the dotenv config, OAuth token files per provider/account slot under
//! the config directory, and — for Codex only — a read-only fallback to
//! the provider's own CLI token file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use gproxy_provider_core::{AccountSlot, CredentialStore, OAuthTokenRecord, ProviderError, ProviderResult};

pub struct FileCredentialStore {
    config_dir: PathBuf,
    env: HashMap<String, String>,
    /// One mutex per `provider:slot` pair, serializing the read-modify-write
    /// a refresh performs (§5: "one must win the file write", readers are
    /// never blocked by this — it only guards the write-back in
    /// `save_oauth_tokens`).
    write_locks: Mutex<HashMap<String, std::sync::Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCredentialStore {
    pub fn new(config_dir: PathBuf, env: HashMap<String, String>) -> Self {
        Self { config_dir, env, write_locks: Mutex::new(HashMap::new()) }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn token_file_path(&self, provider: &str, slot: AccountSlot) -> PathBuf {
        self.config_dir.join(format!("{provider}-oauth{}.json", slot_suffix(provider, slot)))
    }

    async fn lock_for(&self, provider: &str, slot: AccountSlot) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let key = format!("{provider}:{}", slot.file_suffix());
        let mut guard = self.write_locks.lock().expect("credential write lock poisoned");
        guard.entry(key).or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(()))).clone()
    }
}

/// Google's token files are named `google-oauth.json` /
/// `google-oauth-<n>.json` (§6) even though the in-memory provider tag and
/// adapter call this provider "gemini"; every other provider's filename
/// matches its tag.
fn provider_file_stem(provider: &str) -> &str {
    match provider {
        "gemini" => "google",
        other => other,
    }
}

fn slot_suffix(_provider: &str, slot: AccountSlot) -> &'static str {
    slot.file_suffix()
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    fn get_env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned().or_else(|| std::env::var(key).ok())
    }

    async fn load_oauth_tokens(
        &self,
        provider: &str,
        slot: AccountSlot,
    ) -> ProviderResult<Option<OAuthTokenRecord>> {
        let stem = provider_file_stem(provider);
        let path = self.config_dir.join(format!("{stem}-oauth{}.json", slot.file_suffix()));
        if let Some(record) = read_record_file(&path).await? {
            return Ok(Some(record));
        }

        // §4.2: for Codex only, fall back to the externally-maintained CLI
        // token file (read-only — the gateway's own file, once it exists,
        // always wins over this).
        if provider == "codex" && slot == AccountSlot::Primary {
            return read_codex_cli_fallback().await;
        }
        Ok(None)
    }

    async fn save_oauth_tokens(
        &self,
        provider: &str,
        slot: AccountSlot,
        record: OAuthTokenRecord,
    ) -> ProviderResult<()> {
        let lock = self.lock_for(provider, slot).await;
        let _guard = lock.lock().await;

        let stem = provider_file_stem(provider);
        let path = self.token_file_path(stem, slot);
        write_record_file(&path, &record).await
    }

    async fn delete_oauth_tokens(&self, provider: &str, slot: AccountSlot) -> ProviderResult<()> {
        let lock = self.lock_for(provider, slot).await;
        let _guard = lock.lock().await;

        let stem = provider_file_stem(provider);
        let path = self.token_file_path(stem, slot);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ProviderError::Other(err.to_string())),
        }
    }
}

async fn read_record_file(path: &Path) -> ProviderResult<Option<OAuthTokenRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let record: OAuthTokenRecord =
                serde_json::from_slice(&bytes).map_err(|err| ProviderError::Other(err.to_string()))?;
            Ok(Some(record))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ProviderError::Other(err.to_string())),
    }
}

/// Writes `path` atomically (write to a sibling temp file, then rename)
/// with owner-only permissions (§3, §6: all OAuth files are mode 0600).
async fn write_record_file(path: &Path, record: &OAuthTokenRecord) -> ProviderResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| ProviderError::Other(err.to_string()))?;
    }
    let json = serde_json::to_vec_pretty(record).map_err(|err| ProviderError::Other(err.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await.map_err(|err| ProviderError::Other(err.to_string()))?;
    set_owner_only_permissions(&tmp_path).await?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> ProviderResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, permissions).await.map_err(|err| ProviderError::Other(err.to_string()))
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> ProviderResult<()> {
    Ok(())
}

/// Parses the OpenAI Codex CLI's own `~/.codex/auth.json`, a different
/// shape than this gateway's own token files (§4.2, §6).
async fn read_codex_cli_fallback() -> ProviderResult<Option<OAuthTokenRecord>> {
    let Some(home) = dirs::home_dir() else {
        return Ok(None);
    };
    let path = home.join(".codex").join("auth.json");
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ProviderError::Other(err.to_string())),
    };
    let payload: JsonValue = serde_json::from_slice(&bytes).map_err(|err| ProviderError::Other(err.to_string()))?;
    Ok(codex_cli_payload_to_record(&payload))
}

fn codex_cli_payload_to_record(payload: &JsonValue) -> Option<OAuthTokenRecord> {
    let tokens = payload.get("tokens")?;
    let access_token = tokens.get("access_token")?.as_str()?.to_string();
    let refresh_token = tokens.get("refresh_token").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let id_token = tokens.get("id_token").and_then(|v| v.as_str());
    let account_id = tokens.get("account_id").and_then(|v| v.as_str()).map(str::to_string);

    let claims = id_token.and_then(gproxy_provider_core::decode_jwt_claims);
    let email = claims
        .as_ref()
        .and_then(|claims| claims.get("email"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let expires_at = claims
        .as_ref()
        .and_then(|claims| claims.get("exp"))
        .and_then(|v| v.as_i64())
        .map(|exp| exp * 1000)
        .unwrap_or_else(|| gproxy_common::now_millis() + 3600 * 1000);

    Some(OAuthTokenRecord {
        access_token,
        refresh_token,
        expires_at,
        email,
        extra: serde_json::json!({"account_id": account_id, "id_token": id_token}),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_a_token_record_through_the_filesystem() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf(), HashMap::new());
        let record = OAuthTokenRecord {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: 123,
            email: Some("a@b.com".into()),
            extra: serde_json::json!({}),
        };
        store.save_oauth_tokens("codex", AccountSlot::Primary, record.clone()).await.unwrap();
        let loaded = store.load_oauth_tokens("codex", AccountSlot::Primary).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(loaded.email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn gemini_provider_uses_google_oauth_filename() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf(), HashMap::new());
        let record = OAuthTokenRecord { access_token: "at".into(), ..Default::default() };
        store.save_oauth_tokens("gemini", AccountSlot::Primary, record).await.unwrap();
        assert!(dir.path().join("google-oauth.json").exists());
    }

    #[tokio::test]
    async fn secondary_slot_uses_dash_two_suffix() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf(), HashMap::new());
        let record = OAuthTokenRecord { access_token: "at".into(), ..Default::default() };
        store.save_oauth_tokens("gemini", AccountSlot::Secondary, record).await.unwrap();
        assert!(dir.path().join("google-oauth-2.json").exists());
    }

    #[tokio::test]
    async fn missing_token_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf(), HashMap::new());
        assert!(store.load_oauth_tokens("gemini", AccountSlot::Primary).await.unwrap().is_none());
    }

    #[test]
    fn codex_cli_payload_parses_account_id_and_email() {
        let payload = serde_json::json!({
            "tokens": {
                "access_token": "at",
                "refresh_token": "rt",
                "account_id": "acct_1",
            }
        });
        let record = codex_cli_payload_to_record(&payload).unwrap();
        assert_eq!(record.access_token, "at");
        assert_eq!(record.extra_str("account_id").as_deref(), Some("acct_1"));
    }

    #[test]
    fn env_falls_back_to_process_environment() {
        let store = FileCredentialStore::new(PathBuf::from("/tmp"), HashMap::new());
        unsafe {
            std::env::set_var("GPROXY_TEST_ENV_FALLBACK", "yes");
        }
        assert_eq!(store.get_env("GPROXY_TEST_ENV_FALLBACK").as_deref(), Some("yes"));
        unsafe {
            std::env::remove_var("GPROXY_TEST_ENV_FALLBACK");
        }
    }
}
