//! PKCE login + silent refresh + workspace onboarding for the Gemini
//! (Google Cloud Code Assist) OAuth provider (§4.3). `gemini.rs` calls
//! [`GeminiOAuth::ensure_valid_token`] before every workspace-mode upstream
//! call; the HTTP gateway calls [`GeminiOAuth::start_login`] /
//! [`GeminiOAuth::complete_login`] from the `/google/login*` and
//! `/google/callback` routes.

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

const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";
const OAUTH_STATE_TTL_SECS: u64 = 600;

pub(crate) const CODE_ASSIST_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
pub(crate) const GEMINI_CLI_USER_AGENT: &str = "GeminiCLI/0.1.5 (Windows; AMD64)";

const ONBOARD_POLL_ATTEMPTS: u32 = 30;
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Priority order for `onboardUser`'s `tierId` when no project is already
/// provisioned (§4.3 step 8): paid, then whatever tier the account is
/// currently on, then standard, then free, then whatever the upstream
/// offers first.
const TIER_PRIORITY: &[&str] = &["paid-tier", "current-tier", "standard-tier", "free-tier"];

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

pub struct GeminiOAuth {
    credentials: Arc<dyn CredentialStore>,
}

impl GeminiOAuth {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    pub fn start_login(&self, redirect_uri: Option<&str>) -> LoginStart {
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = generate_state();
        let redirect_uri = redirect_uri.unwrap_or(DEFAULT_REDIRECT_URI).to_string();

        let auth_url = build_authorize_url(&redirect_uri, &code_challenge, &state);

        let mut table = pending_table().lock().expect("gemini oauth pending lock poisoned");
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

    /// Exchanges the code, then runs workspace onboarding (§4.3 step 8):
    /// project id detection never aborts the login — on failure the
    /// record is simply persisted without a project id and the standard
    /// (non-workspace) Gemini API is used for that account going forward.
    pub async fn complete_login(&self, query: Option<&str>) -> ProviderResult<OAuthTokenRecord> {
        let (code, callback_state) = resolve_manual_code_and_state(query)
            .map_err(|message| ProviderError::Other(message.to_string()))?;

        let pending = {
            let mut table = pending_table().lock().expect("gemini oauth pending lock poisoned");
            prune_pending(&mut table);
            let Some(state) = callback_state else {
                return Err(ProviderError::Other("missing state".to_string()));
            };
            table
                .remove(&state)
                .ok_or_else(|| ProviderError::Other("state_mismatch".to_string()))?
        };

        let tokens = exchange_code_for_tokens(&code, &pending.code_verifier, &pending.redirect_uri).await?;
        let mut record = token_response_to_record(tokens)?;

        if let Ok(Some(project_id)) = detect_project_id(&record.access_token).await
            && let Some(map) = record.extra.as_object_mut()
        {
            map.insert("project_id".to_string(), JsonValue::String(project_id));
        }

        self.credentials
            .save_oauth_tokens("gemini", AccountSlot::Primary, record.clone())
            .await?;
        Ok(record)
    }

    /// Invariant 3 (§3): returns an access token with at least 5 minutes of
    /// runway, refreshing first if the stored one is about to expire.
    pub async fn ensure_valid_token(&self, slot: AccountSlot) -> ProviderResult<OAuthTokenRecord> {
        let record = self
            .credentials
            .load_oauth_tokens("gemini", slot)
            .await?
            .ok_or_else(|| ProviderError::CredentialMissing("gemini oauth tokens".to_string()))?;

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
            merge_id_token_email(&mut updated, &id_token);
        }

        self.credentials
            .save_oauth_tokens("gemini", slot, updated.clone())
            .await?;
        Ok(updated)
    }

    pub async fn logout(&self, slot: AccountSlot) -> ProviderResult<()> {
        self.credentials.delete_oauth_tokens("gemini", slot).await
    }
}

fn token_response_to_record(tokens: TokenResponse) -> ProviderResult<OAuthTokenRecord> {
    let refresh_token = tokens
        .refresh_token
        .clone()
        .ok_or_else(|| ProviderError::Other("missing_refresh_token".to_string()))?;

    let email = tokens
        .id_token
        .as_deref()
        .and_then(gproxy_provider_core::decode_jwt_claims)
        .and_then(|claims| claims.get("email").and_then(|v| v.as_str()).map(str::to_string));

    let expires_at = gproxy_common::now_millis() + tokens.expires_in.unwrap_or(3600) * 1000;

    Ok(OAuthTokenRecord {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        email,
        extra: serde_json::json!({}),
    })
}

fn merge_id_token_email(record: &mut OAuthTokenRecord, id_token: &str) {
    let Some(claims) = gproxy_provider_core::decode_jwt_claims(id_token) else {
        return;
    };
    if let Some(email) = claims.get("email").and_then(|v| v.as_str()) {
        record.email = Some(email.to_string());
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
        ("access_type", "offline"),
        ("prompt", "consent"),
        ("include_granted_scopes", "true"),
        ("state", state),
    ];
    let qs = query
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{DEFAULT_AUTH_URL}?{qs}")
}

async fn exchange_code_for_tokens(code: &str, code_verifier: &str, redirect_uri: &str) -> ProviderResult<TokenResponse> {
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&client_secret={}&code_verifier={}",
        urlencoding::encode(code),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(CLIENT_SECRET),
        urlencoding::encode(code_verifier),
    );
    post_token_endpoint_form(body).await
}

/// §4.3: the other of the two OAuth providers whose refresh grant is
/// form-urlencoded with a client secret (the Codex one is JSON without a
/// secret — see `codex_oauth.rs`).
async fn refresh_access_token(refresh_token: &str) -> ProviderResult<TokenResponse> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(CLIENT_SECRET),
    );
    post_token_endpoint_form(body).await
}

async fn post_token_endpoint_form(body: String) -> ProviderResult<TokenResponse> {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/x-www-form-urlencoded");
    let client = http_client::client_for("gemini-oauth");
    let mut builder = client.post(DEFAULT_TOKEN_URL);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(body)
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ProviderError::UpstreamRejected { status: status.as_u16(), message: text });
    }
    serde_json::from_str(&text).map_err(|err| ProviderError::Other(err.to_string()))
}

async fn detect_project_id(access_token: &str) -> ProviderResult<Option<String>> {
    if let Ok(Some(project_id)) = try_load_code_assist(access_token).await {
        return Ok(Some(project_id));
    }
    try_onboard_user(access_token).await
}

fn code_assist_headers(access_token: &str) -> Headers {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "authorization", format!("Bearer {access_token}"));
    header_set(&mut headers, "user-agent", GEMINI_CLI_USER_AGENT);
    header_set(&mut headers, "content-type", "application/json");
    headers
}

async fn try_load_code_assist(access_token: &str) -> ProviderResult<Option<String>> {
    let client = http_client::client_for("gemini-oauth");
    let url = format!("{CODE_ASSIST_BASE_URL}/v1internal:loadCodeAssist");
    let mut builder = client.post(url);
    for (name, value) in &code_assist_headers(access_token) {
        builder = builder.header(name, value);
    }
    let response = builder
        .json(&serde_json::json!({
            "metadata": {"ideType": "ANTIGRAVITY", "platform": "PLATFORM_UNSPECIFIED", "pluginType": "GEMINI"},
        }))
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|err| ProviderError::Other(err.to_string()))?;
    if !status.is_success() {
        return Err(ProviderError::UpstreamRejected {
            status: status.as_u16(),
            message: "loadCodeAssist failed".to_string(),
        });
    }
    let payload: JsonValue = serde_json::from_slice(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
    if payload.get("currentTier").is_none_or(|value| value.is_null()) {
        return Ok(None);
    }
    Ok(payload
        .get("cloudaicompanionProject")
        .and_then(|value| value.as_str())
        .map(str::to_string))
}

async fn try_onboard_user(access_token: &str) -> ProviderResult<Option<String>> {
    let tier_id = pick_onboard_tier(access_token).await?;
    let client = http_client::client_for("gemini-oauth");
    let url = format!("{CODE_ASSIST_BASE_URL}/v1internal:onboardUser");
    let body = serde_json::json!({
        "tierId": tier_id,
        "metadata": {"ideType": "ANTIGRAVITY", "platform": "PLATFORM_UNSPECIFIED", "pluginType": "GEMINI"},
    });

    for _ in 0..ONBOARD_POLL_ATTEMPTS {
        let mut builder = client.post(url.clone());
        for (name, value) in &code_assist_headers(access_token) {
            builder = builder.header(name, value);
        }
        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let status = response.status();
        let payload_bytes = response.bytes().await.map_err(|err| ProviderError::Other(err.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::UpstreamRejected {
                status: status.as_u16(),
                message: "onboardUser failed".to_string(),
            });
        }
        let payload: JsonValue =
            serde_json::from_slice(&payload_bytes).map_err(|err| ProviderError::Other(err.to_string()))?;
        if payload.get("done").and_then(|value| value.as_bool()) == Some(true) {
            return Ok(extract_onboarded_project_id(&payload));
        }
        tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
    }
    Ok(None)
}

fn extract_onboarded_project_id(payload: &JsonValue) -> Option<String> {
    let project_value = payload.get("response").and_then(|value| value.get("cloudaicompanionProject"))?;
    project_value
        .get("id")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .or_else(|| project_value.as_str().map(str::to_string))
}

/// §4.3 step 8's tier priority: paid, current, standard, free, then
/// whichever tier the upstream lists first.
async fn pick_onboard_tier(access_token: &str) -> ProviderResult<String> {
    let client = http_client::client_for("gemini-oauth");
    let url = format!("{CODE_ASSIST_BASE_URL}/v1internal:loadCodeAssist");
    let mut builder = client.post(url);
    for (name, value) in &code_assist_headers(access_token) {
        builder = builder.header(name, value);
    }
    let response = builder
        .json(&serde_json::json!({
            "metadata": {"ideType": "ANTIGRAVITY", "platform": "PLATFORM_UNSPECIFIED", "pluginType": "GEMINI"},
        }))
        .send()
        .await
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|err| ProviderError::Other(err.to_string()))?;
    if !status.is_success() {
        return Ok("free-tier".to_string());
    }
    let payload: JsonValue = serde_json::from_slice(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
    let tiers = payload.get("allowedTiers").and_then(|value| value.as_array()).cloned().unwrap_or_default();
    Ok(select_best_tier(&tiers))
}

fn select_best_tier(tiers: &[JsonValue]) -> String {
    let ids: Vec<&str> = tiers.iter().filter_map(|tier| tier.get("id").and_then(|v| v.as_str())).collect();
    for preferred in TIER_PRIORITY {
        if ids.contains(preferred) {
            return (*preferred).to_string();
        }
    }
    if let Some(default) = tiers.iter().find(|tier| tier.get("isDefault").and_then(|v| v.as_bool()) == Some(true))
        && let Some(id) = default.get("id").and_then(|v| v.as_str())
    {
        return id.to_string();
    }
    ids.first().map(|id| id.to_string()).unwrap_or_else(|| "free-tier".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_pkce_challenge_and_state() {
        let url = build_authorize_url(DEFAULT_REDIRECT_URI, "challenge123", "state456");
        assert!(url.contains("code_challenge=challenge123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=state456"));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn tier_priority_prefers_paid_over_free_even_when_free_is_default() {
        let tiers = serde_json::json!([
            {"id": "free-tier", "isDefault": true},
            {"id": "paid-tier", "isDefault": false},
        ]);
        let tiers = tiers.as_array().unwrap().clone();
        assert_eq!(select_best_tier(&tiers), "paid-tier");
    }

    #[test]
    fn tier_priority_falls_back_to_default_when_none_match_the_known_list() {
        let tiers = serde_json::json!([
            {"id": "enterprise-tier", "isDefault": true},
        ]);
        let tiers = tiers.as_array().unwrap().clone();
        assert_eq!(select_best_tier(&tiers), "enterprise-tier");
    }

    #[test]
    fn tier_priority_falls_back_to_first_listed_when_nothing_is_marked_default() {
        let tiers = serde_json::json!([
            {"id": "mystery-tier"},
        ]);
        let tiers = tiers.as_array().unwrap().clone();
        assert_eq!(select_best_tier(&tiers), "mystery-tier");
    }

    #[test]
    fn extracts_project_id_from_nested_or_flat_response_shape() {
        let nested = serde_json::json!({"done": true, "response": {"cloudaicompanionProject": {"id": "proj-1"}}});
        assert_eq!(extract_onboarded_project_id(&nested).as_deref(), Some("proj-1"));

        let flat = serde_json::json!({"done": true, "response": {"cloudaicompanionProject": "proj-2"}});
        assert_eq!(extract_onboarded_project_id(&flat).as_deref(), Some("proj-2"));
    }
}
