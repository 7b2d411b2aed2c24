//! §4.6.1, upstream U-R: the OpenAI Responses API behind the ChatGPT-backed
//! ("Codex") OAuth account. Every message becomes a flat "input item";
//! `tool_use`/`tool_result` pairs become adjacent `function_call` /
//! `function_call_output` items carrying a shared `call_id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value as JsonValue};

use gproxy_protocol::claude::encoder::StreamEncoder;
use gproxy_protocol::claude::types::{ContentBlock, MessageRole, Request as CanonicalRequest, StopReason};
use gproxy_protocol::sse::SseParser;
use gproxy_provider_core::{
    AccountSlot, BodyStream, CredentialStore, DispatchContext, Headers, Provider, ProviderError,
    ProviderResult, ProviderTag, ReasoningLevel, header_set,
};

use crate::http_client;
use crate::providers::codex_oauth::CodexOAuth;

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const ORIGINATOR: &str = "codex_cli_rs";
const USER_AGENT: &str = "codex_cli_rs/0.99.0";

pub struct CodexResponsesProvider {
    credentials: Arc<dyn CredentialStore>,
    oauth: CodexOAuth,
}

impl CodexResponsesProvider {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        let oauth = CodexOAuth::new(credentials.clone());
        Self { credentials, oauth }
    }

    fn base_url(&self) -> String {
        self.credentials
            .get_env("CODEX_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }
}

#[async_trait]
impl Provider for CodexResponsesProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::CodexOAuth
    }

    async fn ensure_ready(&self, _ctx: &DispatchContext) -> ProviderResult<()> {
        self.oauth.ensure_valid_token(AccountSlot::Primary).await?;
        Ok(())
    }

    async fn stream(&self, request: CanonicalRequest, ctx: DispatchContext) -> ProviderResult<BodyStream> {
        let token = self.oauth.ensure_valid_token(AccountSlot::Primary).await?;
        let account_id = token
            .extra_str("account_id")
            .ok_or_else(|| ProviderError::Config("codex oauth record missing account_id".to_string()))?;

        let body = build_request_body(&request, &ctx);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "authorization", format!("Bearer {}", token.access_token));
        header_set(&mut headers, "chatgpt-account-id", account_id);
        header_set(&mut headers, "originator", ORIGINATOR);
        header_set(&mut headers, "user-agent", USER_AGENT);
        header_set(&mut headers, "content-type", "application/json");
        header_set(&mut headers, "accept", "application/json");

        let client = http_client::client_for("codex-responses");
        let mut builder = client.post(format!("{}/responses", self.base_url().trim_end_matches('/')));
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
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamRejected {
                status: status.as_u16(),
                message: truncate(&text, 300),
            });
        }

        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let model = request.model.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(32);
        tokio::spawn(async move {
            drive_responses_stream(response, message_id, model, tx).await;
        });
        Ok(crate::stream_relay::channel_to_body_stream(rx))
    }
}

fn build_request_body(request: &CanonicalRequest, ctx: &DispatchContext) -> JsonValue {
    let mut input: Vec<JsonValue> = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        let text_type = match message.role {
            MessageRole::User => "input_text",
            MessageRole::Assistant => "output_text",
        };

        let mut content: Vec<JsonValue> = Vec::new();
        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    content.push(serde_json::json!({"type": text_type, "text": text}));
                }
                ContentBlock::Image { source } => {
                    // The vision fallback runs before this adapter for any
                    // upstream that doesn't accept images (§4.8); this is
                    // only reached if that step was skipped.
                    let placeholder = source.url.clone().unwrap_or_else(|| "[image omitted]".to_string());
                    content.push(serde_json::json!({"type": text_type, "text": placeholder}));
                }
                ContentBlock::ToolUse { id, name, input: args } => {
                    if !content.is_empty() {
                        input.push(serde_json::json!({"type": "message", "role": role, "content": content}));
                        content = Vec::new();
                    }
                    input.push(serde_json::json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": serde_json::to_string(&args).unwrap_or_default(),
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content: result_text, .. } => {
                    if !content.is_empty() {
                        input.push(serde_json::json!({"type": "message", "role": role, "content": content}));
                        content = Vec::new();
                    }
                    input.push(serde_json::json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": result_text.unwrap_or_default(),
                    }));
                }
            }
        }
        if !content.is_empty() {
            input.push(serde_json::json!({"type": "message", "role": role, "content": content}));
        }
    }

    let mut tools: Vec<JsonValue> = request
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool.input_schema,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    tools.push(serde_json::json!({"type": "web_search"}));

    let effort = ctx.reasoning.unwrap_or(ReasoningLevel::High).to_string();

    let mut body = Map::new();
    body.insert("model".to_string(), JsonValue::String(request.model.clone()));
    body.insert("input".to_string(), JsonValue::Array(input));
    body.insert("tools".to_string(), JsonValue::Array(tools));
    body.insert("stream".to_string(), JsonValue::Bool(true));
    body.insert("store".to_string(), JsonValue::Bool(false));
    body.insert("reasoning".to_string(), serde_json::json!({"effort": effort, "summary": "auto"}));
    if let Some(system) = &request.system {
        body.insert("instructions".to_string(), JsonValue::String(system.joined_text()));
    }
    JsonValue::Object(body)
}

#[derive(Default, Clone)]
struct PendingFunctionCall {
    call_id: String,
    name: String,
    arguments: String,
}

async fn drive_responses_stream(
    response: wreq::Response,
    message_id: String,
    model: String,
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
) {
    let mut parser = SseParser::new();
    let mut encoder = StreamEncoder::new(message_id, model);
    let mut pending_calls: BTreeMap<u64, PendingFunctionCall> = BTreeMap::new();
    let mut upstream = response.bytes_stream();

    while let Some(chunk) = upstream.next().await {
        let Ok(bytes) = chunk else { break };
        for event in parser.push_bytes(&bytes) {
            let parsed: Result<JsonValue, _> = serde_json::from_str(&event.data);
            let Ok(value) = parsed else { continue };
            let Some(event_type) = value.get("type").and_then(|t| t.as_str()) else { continue };

            match event_type {
                "response.reasoning_summary_text.delta" => {
                    if let Some(delta) = value.get("delta").and_then(|d| d.as_str()) {
                        if !send_all(&tx, encoder.push_thinking_delta(delta)).await {
                            return;
                        }
                    }
                }
                "response.output_text.delta" => {
                    if let Some(delta) = value.get("delta").and_then(|d| d.as_str()) {
                        if !send_all(&tx, encoder.push_text_delta(delta)).await {
                            return;
                        }
                    }
                }
                "response.function_call_arguments.delta" => {
                    let Some(index) = value.get("output_index").and_then(|i| i.as_u64()) else { continue };
                    let Some(delta) = value.get("delta").and_then(|d| d.as_str()) else { continue };
                    pending_calls.entry(index).or_default().arguments.push_str(delta);
                }
                "response.output_item.added" | "response.output_item.done" => {
                    let Some(item) = value.get("item") else { continue };
                    let Some(item_type) = item.get("type").and_then(|t| t.as_str()) else { continue };
                    if item_type != "function_call" {
                        continue;
                    }
                    let Some(index) = value.get("output_index").and_then(|i| i.as_u64()) else { continue };
                    let entry = pending_calls.entry(index).or_default();
                    if let Some(call_id) = item.get("call_id").and_then(|v| v.as_str()) {
                        entry.call_id = call_id.to_string();
                    }
                    if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
                        entry.name = name.to_string();
                    }
                    if let Some(arguments) = item.get("arguments").and_then(|v| v.as_str()) {
                        if !arguments.is_empty() {
                            entry.arguments = arguments.to_string();
                        }
                    }
                }
                _ => {}
            }
        }
    }
    let _ = parser.finish();

    let has_calls = !pending_calls.is_empty();
    for (_, call) in pending_calls {
        if call.call_id.is_empty() {
            continue;
        }
        if !send_all(&tx, encoder.start_tool_use(&call.call_id, &call.name)).await {
            return;
        }
        if !call.arguments.is_empty() && !send_all(&tx, encoder.push_tool_input_delta(&call.arguments)).await {
            return;
        }
    }
    let stop_reason = if has_calls { StopReason::ToolUse } else { StopReason::EndTurn };
    let _ = send_all(&tx, encoder.finish(stop_reason)).await;
}

async fn send_all(tx: &tokio::sync::mpsc::Sender<bytes::Bytes>, frames: Vec<bytes::Bytes>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::claude::types::{Message, MessageContent};

    #[test]
    fn tool_use_and_tool_result_become_adjacent_items_sharing_call_id() {
        let request = CanonicalRequest {
            model: "gpt-5.3-codex".into(),
            messages: vec![
                Message {
                    role: MessageRole::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "search".into(),
                        input: serde_json::json!({"q": "rust"}),
                    }]),
                },
                Message {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "call_1".into(),
                        content: Some("result text".into()),
                        is_error: false,
                    }]),
                },
            ],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let ctx = DispatchContext { trace_id: "t".into(), model: "gpt-5.3-codex".into(), reasoning: None };
        let body = build_request_body(&request, &ctx);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "function_call");
        assert_eq!(input[0]["call_id"], "call_1");
        assert_eq!(input[1]["type"], "function_call_output");
        assert_eq!(input[1]["call_id"], "call_1");
    }

    #[test]
    fn web_search_tool_is_always_appended() {
        let request = CanonicalRequest {
            model: "gpt-5.3-codex".into(),
            messages: vec![],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let ctx = DispatchContext { trace_id: "t".into(), model: "gpt-5.3-codex".into(), reasoning: None };
        let body = build_request_body(&request, &ctx);
        let tools = body["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["type"] == "web_search"));
    }

    #[test]
    fn reasoning_defaults_to_high_effort() {
        let request = CanonicalRequest {
            model: "gpt-5.3-codex".into(),
            messages: vec![],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let ctx = DispatchContext { trace_id: "t".into(), model: "gpt-5.3-codex".into(), reasoning: None };
        let body = build_request_body(&request, &ctx);
        assert_eq!(body["reasoning"]["effort"], "high");
    }
}
