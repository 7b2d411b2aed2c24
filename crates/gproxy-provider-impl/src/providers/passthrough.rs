//! C7, §4.7: for upstreams that already speak Protocol-A, forward the
//! request bytes unchanged and relay the response stream verbatim. The
//! only edits made to the outbound body are `model` (resolved name) and
//! forcing `stream: true`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;

use gproxy_protocol::claude::types::Request as CanonicalRequest;
use gproxy_provider_core::{
    BodyStream, CredentialStore, DispatchContext, Headers, Provider, ProviderError,
    ProviderResult, ProviderTag, header_set,
};
use std::sync::Arc;

use crate::http_client;

pub struct PassthroughProvider {
    tag: ProviderTag,
    client_key: &'static str,
    base_url_env: &'static str,
    api_key_env: &'static str,
    credentials: Arc<dyn CredentialStore>,
}

impl PassthroughProvider {
    pub fn anthropic(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            tag: ProviderTag::PassthroughAnthropic,
            client_key: "passthrough-anthropic",
            base_url_env: "ANTHROPIC_UPSTREAM_URL",
            api_key_env: "ANTHROPIC_API_KEY",
            credentials,
        }
    }

    pub fn glm(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            tag: ProviderTag::PassthroughGlm,
            client_key: "passthrough-glm",
            base_url_env: "GLM_UPSTREAM_URL",
            api_key_env: "ZAI_API_KEY",
            credentials,
        }
    }

    fn base_url(&self) -> ProviderResult<String> {
        self.credentials
            .get_env(self.base_url_env)
            .ok_or_else(|| ProviderError::Config(format!("{} not set", self.base_url_env)))
    }

    fn api_key(&self) -> ProviderResult<String> {
        self.credentials
            .get_env(self.api_key_env)
            .or_else(|| {
                if self.api_key_env == "ZAI_API_KEY" {
                    self.credentials.get_env("GLM_API_KEY")
                } else {
                    None
                }
            })
            .ok_or_else(|| ProviderError::CredentialMissing(self.api_key_env.to_string()))
    }
}

#[async_trait]
impl Provider for PassthroughProvider {
    fn tag(&self) -> ProviderTag {
        self.tag
    }

    async fn ensure_ready(&self, _ctx: &DispatchContext) -> ProviderResult<()> {
        self.base_url()?;
        self.api_key()?;
        Ok(())
    }

    /// Deliberately returns an error for a non-2xx upstream response
    /// instead of folding it into the stream: §4.9 step 5 defers header
    /// flushing for this adapter precisely so the caller can still surface
    /// the upstream's own status code.
    async fn stream(&self, request: CanonicalRequest, _ctx: DispatchContext) -> ProviderResult<BodyStream> {
        let base_url = self.base_url()?;
        let api_key = self.api_key()?;

        let mut body: JsonValue = serde_json::to_value(&request)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        if let Some(map) = body.as_object_mut() {
            map.insert("model".to_string(), JsonValue::String(request.model.clone()));
            map.insert("stream".to_string(), JsonValue::Bool(true));
        }

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        match self.tag {
            ProviderTag::PassthroughAnthropic => {
                let version = self
                    .credentials
                    .get_env("ANTHROPIC_VERSION")
                    .unwrap_or_else(|| "2023-06-01".to_string());
                header_set(&mut headers, "x-api-key", api_key);
                header_set(&mut headers, "anthropic-version", version);
            }
            _ => header_set(&mut headers, "authorization", format!("Bearer {api_key}")),
        }

        let client = http_client::client_for(self.client_key);
        let mut builder = client.post(format!("{}/v1/messages", base_url.trim_end_matches('/')));
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_default();
            return Err(ProviderError::UpstreamRejected {
                status: status.as_u16(),
                message: truncate(&text, 300),
            });
        }

        // Copies bytes through until EOF or the first transport error;
        // a broken upstream connection just ends the downstream stream
        // early rather than corrupting it (§7 `ClientCancelled`-adjacent).
        let upstream = response
            .bytes_stream()
            .map(|chunk| chunk.ok())
            .take_while(|chunk| futures_util::future::ready(chunk.is_some()))
            .map(|chunk| chunk.unwrap_or_default());
        Ok(Box::pin(upstream))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}
