//! PKCE login + silent refresh for the Codex (ChatGPT-backed) OAuth
//! provider (§4.3). `codex_responses.rs` calls [`CodexOAuth::ensure_valid_token`]
//! before every upstream call; the HTTP gateway calls [`CodexOAuth::start_login`]
//! / [`CodexOAuth::complete_login`] from the `/codex/login*` and
//! `/codex/callback` routes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use gproxy_provider_core::{
    AccountSlot, CredentialStore, Headers, OAuthTokenRecord, ProviderError, ProviderResult,
    header_set,
};

use crate::http_client;
use crate::oauth_common::{
    generate_code_challenge, generate_code_verifier, generate_state, resolve_manual_code_and_state,
};

const DEFAULT_ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
const OAUTH_SCOPE: &str = "openid profile email offline_access";
const OAUTH_ORIGINATOR: &str = "codex_cli_rs";
const OAUTH_STATE_TTL_SECS: u64 = 600;

struct PendingAuth {
    code_verifier: String,
    redirect_uri: String,
    created_at: Instant,
}

static PENDING: OnceLock<Mutex<HashMap<String, PendingAuth>>> = OnceLock::new();

fn pending_table() -> &'static Mutex<HashMap<String, PendingAuth>> {
    PENDING.get_or_init(|| Mutex::new(HashMap::new()))
}

fn prune_pending(table: &mut HashMap<String, PendingAuth>) {
    let now = Instant::now();
    table.retain(|_, entry| now.duration_since(entry.created_at) <= Duration::from_secs(OAUTH_STATE_TTL_SECS));
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct LoginStart {
    pub auth_url: String,
    pub state: String,
}

pub struct CodexOAuth {
    credentials: Arc<dyn CredentialStore>,
}

impl CodexOAuth {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Step 1-4 of §4.3's login sequence: generate verifier/challenge/state,
    /// park the verifier in the pending table, and hand back the URL to open.
    pub fn start_login(&self, redirect_uri: Option<&str>) -> LoginStart {
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = generate_state();
        let redirect_uri = redirect_uri.unwrap_or(DEFAULT_REDIRECT_URI).to_string();

        let auth_url = build_authorize_url(&redirect_uri, &code_challenge, &state);

        let mut table = pending_table().lock().expect("codex oauth pending lock poisoned");
        prune_pending(&mut table);
        table.insert(
            state.clone(),
            PendingAuth {
                code_verifier,
                redirect_uri: redirect_uri.clone(),
                created_at: Instant::now(),
            },
        );

        LoginStart { auth_url, state }
    }

    /// Step 5-9: validate the callback's state, exchange the code, parse
    /// the id token for email/account id, and persist the token record.
    pub async fn complete_login(&self, query: Option<&str>) -> ProviderResult<OAuthTokenRecord> {
        let (code, callback_state) = resolve_manual_code_and_state(query)
            .map_err(|message| ProviderError::Other(message.to_string()))?;

        let pending = {
            let mut table = pending_table().lock().expect("codex oauth pending lock poisoned");
            prune_pending(&mut table);
            let Some(state) = callback_state else {
                return Err(ProviderError::Other("missing state".to_string()));
            };
            table
                .remove(&state)
                .ok_or_else(|| ProviderError::Other("state_mismatch".to_string()))?
        };

        let tokens = exchange_code_for_tokens(&code, &pending.code_verifier, &pending.redirect_uri).await?;

        let record = token_response_to_record(tokens)?;
        self.credentials
            .save_oauth_tokens("codex", AccountSlot::Primary, record.clone())
            .await?;
        Ok(record)
    }

    /// Invariant 3 (§3): returns an access token with at least 5 minutes of
    /// runway, refreshing first if the stored one is about to expire.
    pub async fn ensure_valid_token(&self, slot: AccountSlot) -> ProviderResult<OAuthTokenRecord> {
        let record = self
            .credentials
            .load_oauth_tokens("codex", slot)
            .await?
            .ok_or_else(|| ProviderError::CredentialMissing("codex oauth tokens".to_string()))?;

        if !record.needs_refresh(gproxy_common::now_millis()) {
            return Ok(record);
        }

        let refreshed = refresh_access_token(&record.refresh_token)
            .await
            .map_err(|err| ProviderError::CredentialExpired(err.to_string()))?;

        let mut updated = record;
        updated.access_token = refreshed.access_token;
        if let Some(refresh_token) = refreshed.refresh_token {
            updated.refresh_token = refresh_token;
        }
        updated.expires_at = gproxy_common::now_millis() + refreshed.expires_in.unwrap_or(3600) * 1000;
        if let Some(id_token) = refreshed.id_token {
            merge_id_token_claims(&mut updated, &id_token);
        }

        self.credentials
            .save_oauth_tokens("codex", slot, updated.clone())
            .await?;
        Ok(updated)
    }

    pub async fn logout(&self, slot: AccountSlot) -> ProviderResult<()> {
        self.credentials.delete_oauth_tokens("codex", slot).await
    }
}

fn token_response_to_record(tokens: TokenResponse) -> ProviderResult<OAuthTokenRecord> {
    let refresh_token = tokens
        .refresh_token
        .clone()
        .ok_or_else(|| ProviderError::Other("missing_refresh_token".to_string()))?;
    let id_token = tokens
        .id_token
        .clone()
        .ok_or_else(|| ProviderError::Other("missing_id_token".to_string()))?;

    let claims = gproxy_provider_core::decode_jwt_claims(&id_token).unwrap_or(JsonValue::Null);
    let email = claims.get("email").and_then(|v| v.as_str()).map(str::to_string);
    let account_id = claims
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Other("missing_account_id".to_string()))?;

    let expires_at = gproxy_common::now_millis() + tokens.expires_in.unwrap_or(3600) * 1000;

    Ok(OAuthTokenRecord {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        email,
        extra: serde_json::json!({"account_id": account_id, "id_token": id_token}),
    })
}

fn merge_id_token_claims(record: &mut OAuthTokenRecord, id_token: &str) {
    let Some(claims) = gproxy_provider_core::decode_jwt_claims(id_token) else {
        return;
    };
    if let Some(email) = claims.get("email").and_then(|v| v.as_str()) {
        record.email = Some(email.to_string());
    }
    if let Some(account_id) = claims
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(|v| v.as_str())
    {
        if let Some(map) = record.extra.as_object_mut() {
            map.insert("account_id".to_string(), JsonValue::String(account_id.to_string()));
        }
    }
    if let Some(map) = record.extra.as_object_mut() {
        map.insert("id_token".to_string(), JsonValue::String(id_token.to_string()));
    }
}

fn build_authorize_url(redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    let query = [
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", redirect_uri),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("state", state),
        ("originator", OAUTH_ORIGINATOR),
    ];
    let qs = query
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{DEFAULT_ISSUER}/oauth/authorize?{qs}")
}

async fn exchange_code_for_tokens(code: &str, code_verifier: &str, redirect_uri: &str) -> ProviderResult<TokenResponse> {
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&code_verifier={}",
        urlencoding::encode(code),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(code_verifier),
    );
    post_token_endpoint_form(body).await
}

/// §4.3: the Codex token endpoint is the one of the two OAuth providers
/// whose refresh grant is JSON without a client secret (the other,
/// Gemini's, is form-urlencoded with one — see `gemini_oauth.rs`).
async fn refresh_access_token(refresh_token: &str) -> ProviderResult<TokenResponse> {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/json");
    let client = http_client::client_for("codex-oauth");
    let mut builder = client.post(format!("{DEFAULT_ISSUER}/oauth/token"));
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": CLIENT_ID,
        }))
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    parse_token_response(response).await
}

async fn post_token_endpoint_form(body: String) -> ProviderResult<TokenResponse> {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/x-www-form-urlencoded");
    let client = http_client::client_for("codex-oauth");
    let mut builder = client.post(format!("{DEFAULT_ISSUER}/oauth/token"));
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(body)
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    parse_token_response(response).await
}

async fn parse_token_response(response: wreq::Response) -> ProviderResult<TokenResponse> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ProviderError::UpstreamRejected {
            status: status.as_u16(),
            message: text,
        });
    }
    serde_json::from_str(&text).map_err(|err| ProviderError::Other(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_the_required_query_parameters() {
        let url = build_authorize_url(DEFAULT_REDIRECT_URI, "challenge123", "state456");
        assert!(url.contains("id_token_add_organizations=true"));
        assert!(url.contains("codex_cli_simplified_flow=true"));
        assert!(url.contains(&format!("originator={OAUTH_ORIGINATOR}")));
        assert!(url.contains("code_challenge=challenge123"));
        assert!(url.contains("state=state456"));
    }

    #[test]
    fn token_response_to_record_extracts_account_id_and_email() {
        let id_token = fake_id_token(r#"{"email":"dev@example.com","https://api.openai.com/auth":{"chatgpt_account_id":"acct_1"}}"#);
        let tokens = TokenResponse {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            id_token: Some(id_token),
            expires_in: Some(3600),
        };
        let record = token_response_to_record(tokens).unwrap();
        assert_eq!(record.email.as_deref(), Some("dev@example.com"));
        assert_eq!(record.extra_str("account_id").as_deref(), Some("acct_1"));
    }

    #[test]
    fn token_response_without_account_id_claim_is_rejected() {
        let id_token = fake_id_token(r#"{"email":"dev@example.com"}"#);
        let tokens = TokenResponse {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            id_token: Some(id_token),
            expires_in: Some(3600),
        };
        assert!(token_response_to_record(tokens).is_err());
    }

    fn fake_id_token(payload_json: &str) -> String {
        fn b64(input: &[u8]) -> String {
            const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
            let mut out = String::new();
            for chunk in input.chunks(3) {
                let b0 = chunk[0] as u32;
                let b1 = *chunk.get(1).unwrap_or(&0) as u32;
                let b2 = *chunk.get(2).unwrap_or(&0) as u32;
                let n = (b0 << 16) | (b1 << 8) | b2;
                out.push(TABLE[((n >> 18) & 63) as usize] as char);
                out.push(TABLE[((n >> 12) & 63) as usize] as char);
                if chunk.len() > 1 {
                    out.push(TABLE[((n >> 6) & 63) as usize] as char);
                }
                if chunk.len() > 2 {
                    out.push(TABLE[(n & 63) as usize] as char);
                }
            }
            out
        }
        format!("header.{}.sig", b64(payload_json.as_bytes()))
    }
}
