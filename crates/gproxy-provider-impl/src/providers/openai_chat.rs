//! §4.6.2 (U-C, OpenAI Chat Completions) and §4.6.4 (U-OR, OpenRouter):
//! both upstreams speak the same `chat/completions` shape, so one adapter
//! serves `openai-key` and `openrouter` with a small config difference
//! (base url, optional `Referer`/`X-Title` headers, whether `reasoning_effort`
//! is sent).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use gproxy_protocol::claude::encoder::StreamEncoder;
use gproxy_protocol::claude::types::{ContentBlock, MessageRole, Request as CanonicalRequest, StopReason};
use gproxy_protocol::sse::SseParser;
use gproxy_provider_core::{
    BodyStream, CredentialStore, DispatchContext, Headers, Provider, ProviderError,
    ProviderResult, ProviderTag, header_set,
};

use crate::http_client;

pub struct OpenAiChatProvider {
    tag: ProviderTag,
    client_key: &'static str,
    default_base_url: &'static str,
    base_url_env: &'static str,
    api_key_env: &'static str,
    send_reasoning_effort: bool,
    extra_headers: Vec<(&'static str, &'static str)>,
    credentials: Arc<dyn CredentialStore>,
}

impl OpenAiChatProvider {
    pub fn openai_key(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            tag: ProviderTag::OpenAiKey,
            client_key: "openai-chat",
            default_base_url: "https://api.openai.com/v1",
            base_url_env: "OPENAI_BASE_URL",
            api_key_env: "OPENAI_API_KEY",
            send_reasoning_effort: true,
            extra_headers: Vec::new(),
            credentials,
        }
    }

    pub fn openrouter(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            tag: ProviderTag::OpenRouter,
            client_key: "openrouter",
            default_base_url: "https://openrouter.ai/api/v1",
            base_url_env: "OPENROUTER_BASE_URL",
            api_key_env: "OPENROUTER_API_KEY",
            send_reasoning_effort: false,
            extra_headers: Vec::new(),
            credentials,
        }
    }

    fn base_url(&self) -> String {
        self.credentials
            .get_env(self.base_url_env)
            .unwrap_or_else(|| self.default_base_url.to_string())
    }

    fn api_key(&self) -> ProviderResult<String> {
        self.credentials
            .get_env(self.api_key_env)
            .ok_or_else(|| ProviderError::CredentialMissing(self.api_key_env.to_string()))
    }
}

#[async_trait]
impl Provider for OpenAiChatProvider {
    fn tag(&self) -> ProviderTag {
        self.tag
    }

    async fn ensure_ready(&self, _ctx: &DispatchContext) -> ProviderResult<()> {
        self.api_key()?;
        Ok(())
    }

    async fn stream(&self, request: CanonicalRequest, ctx: DispatchContext) -> ProviderResult<BodyStream> {
        let api_key = self.api_key()?;
        let body = build_request_body(&request, &ctx, self.send_reasoning_effort);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "authorization", format!("Bearer {api_key}"));
        header_set(&mut headers, "content-type", "application/json");
        for (name, value) in &self.extra_headers {
            header_set(&mut headers, *name, *value);
        }
        if self.tag == ProviderTag::OpenRouter {
            if let Some(referer) = self.credentials.get_env("OPENROUTER_REFERER") {
                header_set(&mut headers, "HTTP-Referer", referer);
            }
            if let Some(title) = self.credentials.get_env("OPENROUTER_TITLE") {
                header_set(&mut headers, "X-Title", title);
            }
        }

        let client = http_client::client_for(self.client_key);
        let mut builder = client.post(format!("{}/chat/completions", self.base_url().trim_end_matches('/')));
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))?;

        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let model = request.model.clone();

        run_chat_completions_stream(response, message_id, model).await
    }
}

/// Shared by `openai-key` and `openrouter`: once the upstream response is
/// open, drive the Protocol-A encoder from its SSE event stream on a
/// dedicated task and relay encoded frames through a channel. A task (not
/// a hand-rolled `Stream` impl) is the simplest way to drive an async
/// parser loop that needs to hold state across upstream chunks.
async fn run_chat_completions_stream(
    response: wreq::Response,
    message_id: String,
    model: String,
) -> ProviderResult<BodyStream> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::UpstreamRejected {
            status: status.as_u16(),
            message: truncate(&text, 300),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(32);
    tokio::spawn(async move {
        drive_chat_completions(response, message_id, model, tx).await;
    });
    Ok(crate::stream_relay::channel_to_body_stream(rx))
}

#[derive(Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    #[serde(default)]
    delta: ChatCompletionDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatCompletionToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChatCompletionFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

async fn drive_chat_completions(
    response: wreq::Response,
    message_id: String,
    model: String,
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
) {
    let mut parser = SseParser::new();
    let mut encoder = StreamEncoder::new(message_id, model);
    let mut tool_calls: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
    let mut upstream = response.bytes_stream();

    while let Some(chunk) = upstream.next().await {
        let Ok(bytes) = chunk else { break };
        for event in parser.push_bytes(&bytes) {
            if event.data.trim() == "[DONE]" {
                continue;
            }
            let parsed: Result<ChatCompletionChunk, _> = serde_json::from_str(&event.data);
            let Ok(parsed) = parsed else { continue };
            let Some(choice) = parsed.choices.into_iter().next() else { continue };
            if let Some(text) = choice.delta.content {
                for frame in encoder.push_text_delta(&text) {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            if let Some(reasoning) = choice.delta.reasoning {
                for frame in encoder.push_thinking_delta(&reasoning) {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            for call in choice.delta.tool_calls {
                let entry = tool_calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        entry.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            let _ = choice.finish_reason;
        }
    }
    for event in parser.finish() {
        if event.data.trim() != "[DONE]" {
            // best effort: a trailing partial frame is rare and not worth failing the stream over
        }
    }

    let has_tool_calls = !tool_calls.is_empty();
    for (_, call) in tool_calls {
        for frame in encoder.start_tool_use(&call.id, &call.name) {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
        if !call.arguments.is_empty() {
            for frame in encoder.push_tool_input_delta(&call.arguments) {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
    let stop_reason = if has_tool_calls { StopReason::ToolUse } else { StopReason::EndTurn };
    for frame in encoder.finish(stop_reason) {
        if tx.send(frame).await.is_err() {
            return;
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

fn build_request_body(request: &CanonicalRequest, ctx: &DispatchContext, send_reasoning_effort: bool) -> JsonValue {
    let mut messages: Vec<JsonValue> = Vec::new();
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system.joined_text()}));
    }

    for message in &request.messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        let blocks = message.content.blocks();

        let mut text_parts: Vec<JsonValue> = Vec::new();
        let mut tool_calls: Vec<JsonValue> = Vec::new();
        let mut tool_results: Vec<JsonValue> = Vec::new();
        let mut has_image = false;

        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    text_parts.push(serde_json::json!({"type": "text", "text": text}));
                }
                ContentBlock::Image { source } => {
                    has_image = true;
                    let url = match (&source.url, &source.data, &source.media_type) {
                        (Some(url), _, _) => url.clone(),
                        (None, Some(data), Some(media_type)) => {
                            format!("data:{media_type};base64,{data}")
                        }
                        _ => continue,
                    };
                    text_parts.push(serde_json::json!({"type": "image_url", "image_url": {"url": url}}));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": serde_json::to_string(&input).unwrap_or_default(),
                        }
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    tool_results.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content.unwrap_or_default(),
                    }));
                }
            }
        }

        if !tool_calls.is_empty() {
            let mut assistant_message = Map::new();
            assistant_message.insert("role".to_string(), JsonValue::String("assistant".to_string()));
            if !text_parts.is_empty() {
                let text = text_parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("");
                assistant_message.insert("content".to_string(), JsonValue::String(text));
            } else {
                assistant_message.insert("content".to_string(), JsonValue::Null);
            }
            assistant_message.insert("tool_calls".to_string(), JsonValue::Array(tool_calls));
            messages.push(JsonValue::Object(assistant_message));
        } else if !text_parts.is_empty() {
            if has_image {
                messages.push(serde_json::json!({"role": role, "content": text_parts}));
            } else {
                let text = text_parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("");
                messages.push(serde_json::json!({"role": role, "content": text}));
            }
        }

        messages.extend(tool_results);
    }

    let mut body = Map::new();
    body.insert("model".to_string(), JsonValue::String(request.model.clone()));
    body.insert("messages".to_string(), JsonValue::Array(messages));
    body.insert("stream".to_string(), JsonValue::Bool(true));
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".to_string(), JsonValue::from(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), JsonValue::from(temperature));
    }
    if let Some(tools) = &request.tools {
        let tools_json: Vec<JsonValue> = tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), JsonValue::Array(tools_json));
    }
    if send_reasoning_effort {
        if let Some(reasoning) = ctx.reasoning {
            body.insert("reasoning_effort".to_string(), JsonValue::String(reasoning.to_string()));
        }
    }
    JsonValue::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::claude::types::{Message, MessageContent};

    #[test]
    fn system_prompt_becomes_a_leading_system_message() {
        let request = CanonicalRequest {
            model: "gpt-5.3".into(),
            messages: vec![Message {
                role: MessageRole::User,
                content: MessageContent::Text("hi".into()),
            }],
            system: Some(gproxy_protocol::claude::types::SystemPrompt::Text("be nice".into())),
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let ctx = DispatchContext {
            trace_id: "t".into(),
            model: "gpt-5.3".into(),
            reasoning: None,
        };
        let body = build_request_body(&request, &ctx, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be nice");
    }

    #[test]
    fn tool_use_and_tool_result_round_trip_ids() {
        let request = CanonicalRequest {
            model: "gpt-5.3".into(),
            messages: vec![
                Message {
                    role: MessageRole::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "search".into(),
                        input: serde_json::json!({"q": "X"}),
                    }]),
                },
                Message {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: Some("ok".into()),
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
        let ctx = DispatchContext { trace_id: "t".into(), model: "gpt-5.3".into(), reasoning: None };
        let body = build_request_body(&request, &ctx, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "toolu_1");
    }

    #[test]
    fn reasoning_effort_only_sent_when_enabled() {
        let request = CanonicalRequest {
            model: "gpt-5.3".into(),
            messages: vec![],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let ctx = DispatchContext {
            trace_id: "t".into(),
            model: "gpt-5.3".into(),
            reasoning: Some(gproxy_provider_core::ReasoningLevel::Low),
        };
        let body = build_request_body(&request, &ctx, true);
        assert_eq!(body["reasoning_effort"], "low");
        let body_disabled = build_request_body(&request, &ctx, false);
        assert!(body_disabled.get("reasoning_effort").is_none());
    }
}
