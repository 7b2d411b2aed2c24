//! POST /v1/messages (§4.9): the main dispatch endpoint.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;

use gproxy_protocol::claude::types::Request as CanonicalRequest;
use gproxy_provider_core::ProviderError;

use crate::state::AppState;

pub async fn post_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CanonicalRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
            );
        }
    };

    let model = request.model.clone();
    let outcome = state.gateway.dispatcher.dispatch(request).await;

    match outcome {
        Ok(outcome) => {
            tracing::info!(
                trace_id = %outcome.trace_id,
                provider = %outcome.selection.provider,
                model = %outcome.selection.model,
                "dispatched"
            );
            // §4.9 step 5: streaming headers are flushed only now, after
            // the upstream call has already succeeded in opening.
            let stream = outcome.body.map(|bytes| Ok::<Bytes, std::io::Error>(bytes));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache, no-transform")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"))
        }
        Err(err) => {
            tracing::warn!(model = %model, error = %err, "dispatch failed pre-stream");
            provider_error_response(err)
        }
    }
}

/// §7: pre-stream error taxonomy mapped to status codes. Nothing here has
/// flushed headers yet, so every case is a plain JSON body.
fn provider_error_response(err: ProviderError) -> Response {
    let status = match &err {
        ProviderError::CredentialMissing(_) | ProviderError::CredentialExpired(_) => StatusCode::UNAUTHORIZED,
        ProviderError::UpstreamRejected { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ProviderError::UpstreamBadStream(_) => StatusCode::BAD_GATEWAY,
        ProviderError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProviderError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({"error": {"type": "proxy_error", "message": message}}))).into_response()
}
