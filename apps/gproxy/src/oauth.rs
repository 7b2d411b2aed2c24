//! OAuth login/callback/status/logout routes (§4.3, §4.9) for the two
//! OAuth-capable providers. Both providers' flows are shaped identically
//! (PKCE start -> browser -> callback -> status -> logout), so the two
//! sets of handlers below are intentionally parallel rather than forced
//! through a shared abstraction that would have to paper over the one
//! real difference: which `OAuthTokenRecord` extras each provider keeps.

use axum::RawQuery;
use axum::extract::State;
use axum::response::Html;
use serde_json::{Value as JsonValue, json};

use gproxy_provider_core::AccountSlot;

use crate::state::AppState;

fn login_page(auth_url: &str) -> Html<String> {
    Html(format!(
        "<html><body><p>Opening your browser for login.</p><p>If it did not open, \
         <a href=\"{auth_url}\">click here</a>.</p></body></html>"
    ))
}

fn callback_result_page(result: Result<Option<String>, String>) -> Html<String> {
    match result {
        Ok(email) => {
            let who = email.unwrap_or_else(|| "your account".to_string());
            Html(format!("<html><body><p>Signed in as {who}. You can close this tab.</p></body></html>"))
        }
        Err(message) => Html(format!("<html><body><p>Login failed: {message}</p></body></html>")),
    }
}

fn status_json(record: Option<gproxy_provider_core::OAuthTokenRecord>) -> JsonValue {
    match record {
        Some(record) => json!({
            "authenticated": true,
            "email": record.email,
            "expiresAt": record.expires_at,
        }),
        None => json!({ "authenticated": false }),
    }
}

pub mod google {
    use super::*;

    pub async fn login(State(state): State<AppState>) -> Html<String> {
        let start = state.gemini_oauth.start_login(None);
        let _ = webbrowser::open(&start.auth_url);
        login_page(&start.auth_url)
    }

    pub async fn login_start(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let start = state.gemini_oauth.start_login(None);
        axum::Json(json!({ "auth_url": start.auth_url, "state": start.state }))
    }

    pub async fn callback(State(state): State<AppState>, RawQuery(query): RawQuery) -> Html<String> {
        let result = state
            .gemini_oauth
            .complete_login(query.as_deref())
            .await
            .map(|record| record.email)
            .map_err(|err| err.to_string());
        callback_result_page(result)
    }

    pub async fn status(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let record = state
            .gateway
            .credentials
            .load_oauth_tokens("gemini", AccountSlot::Primary)
            .await
            .ok()
            .flatten();
        axum::Json(status_json(record))
    }

    pub async fn logout(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let _ = state.gemini_oauth.logout(AccountSlot::Primary).await;
        axum::Json(json!({ "ok": true }))
    }
}

pub mod codex {
    use super::*;

    pub async fn login(State(state): State<AppState>) -> Html<String> {
        let start = state.codex_oauth.start_login(None);
        let _ = webbrowser::open(&start.auth_url);
        login_page(&start.auth_url)
    }

    pub async fn login_start(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let start = state.codex_oauth.start_login(None);
        axum::Json(json!({ "auth_url": start.auth_url, "state": start.state }))
    }

    pub async fn callback(State(state): State<AppState>, RawQuery(query): RawQuery) -> Html<String> {
        let result = state
            .codex_oauth
            .complete_login(query.as_deref())
            .await
            .map(|record| record.email)
            .map_err(|err| err.to_string());
        callback_result_page(result)
    }

    pub async fn status(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let record = state
            .gateway
            .credentials
            .load_oauth_tokens("codex", AccountSlot::Primary)
            .await
            .ok()
            .flatten();
        axum::Json(status_json(record))
    }

    pub async fn logout(State(state): State<AppState>) -> axum::Json<JsonValue> {
        let _ = state.codex_oauth.logout(AccountSlot::Primary).await;
        axum::Json(json!({ "ok": true }))
    }
}
