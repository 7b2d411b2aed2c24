//! §4.6.3 (U-G, Google Gemini): one adapter serves both `gemini-key`
//! (standard generative API, plain API key) and `gemini-oauth` (the
//! Cloud Code Assist workspace backend behind OAuth). The two differ in
//! URL, request envelope, and how the system prompt is carried; the
//! message/tool/streaming translation is otherwise shared.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value as JsonValue};

use gproxy_protocol::claude::encoder::StreamEncoder;
use gproxy_protocol::claude::types::{
    ContentBlock, MessageRole, Request as CanonicalRequest, StopReason,
};
use gproxy_protocol::sse::SseParser;
use gproxy_provider_core::{
    AccountSlot, BodyStream, CredentialStore, DispatchContext, Headers, Provider, ProviderError,
    ProviderResult, ProviderTag, ReasoningLevel, header_set,
};

use crate::http_client;
use crate::providers::gemini_oauth::{GeminiOAuth, CODE_ASSIST_BASE_URL, GEMINI_CLI_USER_AGENT};
use crate::providers::schema_sanitizer;

const STANDARD_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// `thinkingLevel` models that only accept `LOW`/`HIGH` (no `MEDIUM`): a
/// request for `medium` reasoning is promoted to `HIGH` for these.
const LOW_HIGH_ONLY_MODELS: &[&str] = &["gemini-3-flash-preview"];

enum GeminiMode {
    ApiKey,
    Workspace { oauth: Arc<GeminiOAuth> },
}

pub struct GeminiProvider {
    tag: ProviderTag,
    mode: GeminiMode,
    credentials: Arc<dyn CredentialStore>,
}

impl GeminiProvider {
    pub fn api_key(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { tag: ProviderTag::GeminiKey, mode: GeminiMode::ApiKey, credentials }
    }

    pub fn workspace_oauth(credentials: Arc<dyn CredentialStore>) -> Self {
        let oauth = Arc::new(GeminiOAuth::new(credentials.clone()));
        Self { tag: ProviderTag::GeminiOAuth, mode: GeminiMode::Workspace { oauth }, credentials }
    }

    fn base_url(&self) -> String {
        self.credentials.get_env("GEMINI_BASE_URL").unwrap_or_else(|| STANDARD_BASE_URL.to_string())
    }

    fn api_key(&self) -> ProviderResult<String> {
        self.credentials
            .get_env("GEMINI_API_KEY")
            .ok_or_else(|| ProviderError::CredentialMissing("GEMINI_API_KEY".to_string()))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn tag(&self) -> ProviderTag {
        self.tag
    }

    async fn ensure_ready(&self, _ctx: &DispatchContext) -> ProviderResult<()> {
        match &self.mode {
            GeminiMode::ApiKey => {
                self.api_key()?;
                Ok(())
            }
            GeminiMode::Workspace { oauth } => {
                oauth.ensure_valid_token(AccountSlot::Primary).await?;
                Ok(())
            }
        }
    }

    async fn stream(&self, request: CanonicalRequest, ctx: DispatchContext) -> ProviderResult<BodyStream> {
        let reasoning = ctx.reasoning.unwrap_or(ReasoningLevel::High);
        let contents = build_contents(&request);
        let tools = build_tools(&request);

        let client = http_client::client_for("gemini");
        let (url, body, extra_headers) = match &self.mode {
            GeminiMode::ApiKey => {
                let api_key = self.api_key()?;
                let generation_config = build_generation_config(&ctx.model, reasoning);
                let mut body = Map::new();
                body.insert("contents".to_string(), JsonValue::Array(contents));
                if let Some(system) = &request.system {
                    body.insert(
                        "systemInstruction".to_string(),
                        serde_json::json!({"parts": [{"text": system.joined_text()}]}),
                    );
                }
                body.insert("tools".to_string(), JsonValue::Array(tools));
                body.insert("generationConfig".to_string(), generation_config);
                let url = format!(
                    "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
                    self.base_url().trim_end_matches('/'),
                    ctx.model,
                    api_key,
                );
                (url, JsonValue::Object(body), Vec::new())
            }
            GeminiMode::Workspace { oauth } => {
                let record = oauth.ensure_valid_token(AccountSlot::Primary).await?;
                let project_id = record
                    .extra_str("project_id")
                    .ok_or_else(|| ProviderError::Config("missing gemini workspace project id".to_string()))?;
                let generation_config = build_generation_config(&ctx.model, reasoning);

                let mut contents = contents;
                if let Some(system) = &request.system {
                    prepend_system_instructions(&mut contents, &system.joined_text());
                }

                let mut inner = Map::new();
                inner.insert("contents".to_string(), JsonValue::Array(contents));
                inner.insert("tools".to_string(), JsonValue::Array(tools));
                inner.insert("generationConfig".to_string(), generation_config);

                let wrapped = serde_json::json!({
                    "model": ctx.model,
                    "project": project_id,
                    "user_prompt_id": gproxy_common::new_trace_id(),
                    "request": JsonValue::Object(inner),
                });
                let url = format!("{CODE_ASSIST_BASE_URL}/v1internal:streamGenerateContent?alt=sse");
                let headers = vec![
                    ("authorization", format!("Bearer {}", record.access_token)),
                    ("user-agent", GEMINI_CLI_USER_AGENT.to_string()),
                ];
                (url, wrapped, headers)
            }
        };

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        for (name, value) in extra_headers {
            header_set(&mut headers, name, value);
        }

        let mut builder = client.post(url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let response = builder.json(&body).send().await.map_err(|err| ProviderError::Other(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamRejected { status: status.as_u16(), message: truncate(&text, 300) });
        }

        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let model = ctx.model.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(32);
        tokio::spawn(async move {
            drive_gemini_stream(response, message_id, model, request, tx).await;
        });
        Ok(crate::stream_relay::channel_to_body_stream(rx))
    }
}

/// Merges consecutive same-role runs into one `contents[i]` entry and
/// renames the assistant role to `model` (§4.6.3).
fn build_contents(request: &CanonicalRequest) -> Vec<JsonValue> {
    let mut contents: Vec<(String, Vec<JsonValue>)> = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "model",
        };
        let mut parts: Vec<JsonValue> = Vec::new();
        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    parts.push(serde_json::json!({"text": text}));
                }
                ContentBlock::Image { source } => {
                    if let (Some(media_type), Some(data)) = (&source.media_type, &source.data) {
                        parts.push(serde_json::json!({
                            "inlineData": {"mimeType": media_type, "data": data}
                        }));
                    } else if let Some(url) = &source.url {
                        let mime_type = source.media_type.as_deref().unwrap_or("image/jpeg");
                        parts.push(serde_json::json!({
                            "fileData": {"fileUri": url, "mimeType": mime_type}
                        }));
                    }
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    parts.push(serde_json::json!({
                        "functionCall": {"name": name, "args": input},
                        "thoughtSignature": "none",
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    let name = request.tool_name_for_use_id(&tool_use_id).unwrap_or_default();
                    parts.push(serde_json::json!({
                        "functionResponse": {
                            "name": name,
                            "response": {"output": content.unwrap_or_default()},
                        }
                    }));
                }
            }
        }
        if parts.is_empty() {
            continue;
        }
        if let Some(last) = contents.last_mut()
            && last.0 == role
        {
            last.1.extend(parts);
            continue;
        }
        contents.push((role.to_string(), parts));
    }

    contents
        .into_iter()
        .map(|(role, parts)| serde_json::json!({"role": role, "parts": parts}))
        .collect()
}

fn prepend_system_instructions(contents: &mut [JsonValue], system_text: &str) {
    let Some(first) = contents.iter_mut().find(|entry| entry["role"] == "user") else { return };
    let Some(parts) = first.get_mut("parts").and_then(|value| value.as_array_mut()) else { return };
    let prefix = format!("[System Instructions]\n{system_text}\n[End System Instructions]\n\n");
    if let Some(first_part) = parts.first_mut()
        && let Some(text) = first_part.get("text").and_then(|value| value.as_str())
    {
        let merged = format!("{prefix}{text}");
        first_part["text"] = JsonValue::String(merged);
        return;
    }
    parts.insert(0, serde_json::json!({"text": prefix}));
}

/// Tools become `functionDeclarations` with each schema sanitized (§4.6.3);
/// a server-side `google_search` tool is always appended.
fn build_tools(request: &CanonicalRequest) -> Vec<JsonValue> {
    let mut tools = Vec::new();
    if let Some(declared) = &request.tools
        && !declared.is_empty()
    {
        let declarations: Vec<JsonValue> = declared
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": schema_sanitizer::sanitize(&tool.input_schema),
                })
            })
            .collect();
        tools.push(serde_json::json!({"functionDeclarations": declarations}));
    }
    tools.push(serde_json::json!({"googleSearch": {}}));
    tools
}

/// §4.6.3: `3.x`-family models take `thinkingLevel`, `2.5`-family models
/// take `thinkingBudget` as a token count. `includeThoughts` is always on.
fn build_generation_config(model: &str, reasoning: ReasoningLevel) -> JsonValue {
    let mut config = Map::new();
    if model.contains("2.5") {
        let budget = match reasoning {
            ReasoningLevel::Low => 1024,
            ReasoningLevel::Medium => 8192,
            ReasoningLevel::High => 32768,
            ReasoningLevel::XHigh => 65536,
        };
        config.insert(
            "thinkingConfig".to_string(),
            serde_json::json!({"thinkingBudget": budget, "includeThoughts": true}),
        );
    } else {
        let level = thinking_level_for(model, reasoning);
        config.insert(
            "thinkingConfig".to_string(),
            serde_json::json!({"thinkingLevel": level, "includeThoughts": true}),
        );
    }
    JsonValue::Object(config)
}

fn thinking_level_for(model: &str, reasoning: ReasoningLevel) -> &'static str {
    let low_high_only = LOW_HIGH_ONLY_MODELS.iter().any(|needle| model.contains(needle));
    match reasoning {
        ReasoningLevel::Low => "LOW",
        ReasoningLevel::Medium => {
            if low_high_only {
                "HIGH"
            } else {
                "MEDIUM"
            }
        }
        ReasoningLevel::High | ReasoningLevel::XHigh => "HIGH",
    }
}

#[derive(Default, Clone)]
struct PendingFunctionCall {
    name: String,
    args: JsonValue,
}

async fn drive_gemini_stream(
    response: wreq::Response,
    message_id: String,
    model: String,
    _request: CanonicalRequest,
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
) {
    let mut parser = SseParser::new();
    let mut encoder = StreamEncoder::new(message_id, model);
    let mut pending_calls: Vec<PendingFunctionCall> = Vec::new();
    let mut upstream = response.bytes_stream();

    while let Some(chunk) = upstream.next().await {
        let Ok(bytes) = chunk else { break };
        for event in parser.push_bytes(&bytes) {
            let parsed: Result<JsonValue, _> = serde_json::from_str(&event.data);
            let Ok(payload) = parsed else { continue };
            let Some(parts) = payload
                .get("candidates")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("content"))
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            else {
                continue;
            };

            for part in parts {
                let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    let frames = if is_thought {
                        encoder.push_thinking_delta(text)
                    } else {
                        encoder.push_text_delta(text)
                    };
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let args = call.get("args").cloned().unwrap_or(JsonValue::Null);
                    pending_calls.push(PendingFunctionCall { name, args });
                }
            }
        }
    }
    let _ = parser.finish();

    let has_tool_calls = !pending_calls.is_empty();
    for call in pending_calls {
        let id = format!("toolu_{}", uuid::Uuid::new_v4());
        for frame in encoder.start_tool_use(&id, &call.name) {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
        let arguments = serde_json::to_string(&call.args).unwrap_or_default();
        if !arguments.is_empty() && arguments != "null" {
            for frame in encoder.push_tool_input_delta(&arguments) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::claude::types::{Message, MessageContent};

    fn sample_request() -> CanonicalRequest {
        CanonicalRequest {
            model: "gemini-3-pro-preview".into(),
            messages: vec![
                Message { role: MessageRole::User, content: MessageContent::Text("hi".into()) },
                Message { role: MessageRole::User, content: MessageContent::Text("there".into()) },
                Message { role: MessageRole::Assistant, content: MessageContent::Text("hello".into()) },
            ],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        }
    }

    #[test]
    fn consecutive_same_role_messages_merge_into_one_entry() {
        let contents = build_contents(&sample_request());
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn tool_result_recovers_function_name_from_history() {
        let request = CanonicalRequest {
            model: "gemini-3-pro-preview".into(),
            messages: vec![
                Message {
                    role: MessageRole::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "search".into(),
                        input: serde_json::json!({"q": "x"}),
                    }]),
                },
                Message {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: Some("result".into()),
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
        let contents = build_contents(&request);
        let function_response = &contents[1]["parts"][0]["functionResponse"];
        assert_eq!(function_response["name"], "search");
    }

    #[test]
    fn url_sourced_image_becomes_file_data_part() {
        use gproxy_protocol::claude::types::{ImageSource, ImageSourceKind};

        let request = CanonicalRequest {
            model: "gemini-3-pro-preview".into(),
            messages: vec![Message {
                role: MessageRole::User,
                content: MessageContent::Blocks(vec![ContentBlock::Image {
                    source: ImageSource {
                        kind: ImageSourceKind::Url,
                        media_type: None,
                        data: None,
                        url: Some("https://example.com/cat.png".into()),
                    },
                }]),
            }],
            system: None,
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: true,
        };
        let contents = build_contents(&request);
        let part = &contents[0]["parts"][0];
        assert_eq!(part["fileData"]["fileUri"], "https://example.com/cat.png");
        assert_eq!(part["fileData"]["mimeType"], "image/jpeg");
    }

    #[test]
    fn thinking_level_promotes_medium_to_high_for_low_high_only_model() {
        assert_eq!(thinking_level_for("gemini-3-flash-preview", ReasoningLevel::Medium), "HIGH");
        assert_eq!(thinking_level_for("gemini-3-pro-preview", ReasoningLevel::Medium), "MEDIUM");
    }

    #[test]
    fn generation_config_uses_thinking_budget_for_25_family() {
        let config = build_generation_config("gemini-2.5-pro", ReasoningLevel::High);
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], 32768);
        assert_eq!(config["thinkingConfig"]["includeThoughts"], true);
    }

    #[test]
    fn workspace_mode_prepends_system_instructions_to_first_user_message() {
        let mut contents = build_contents(&sample_request());
        prepend_system_instructions(&mut contents, "be nice");
        let text = contents[0]["parts"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("[System Instructions]\nbe nice\n[End System Instructions]"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn google_search_tool_is_always_appended() {
        let request = sample_request();
        let tools = build_tools(&request);
        assert!(tools.iter().any(|tool| tool.get("googleSearch").is_some()));
    }

    #[test]
    fn declared_tools_are_schema_sanitized() {
        let mut request = sample_request();
        request.tools = Some(vec![gproxy_protocol::claude::types::Tool {
            name: "search".into(),
            description: Some("search the web".into()),
            input_schema: serde_json::json!({"type": "object", "properties": {"q": {"type": "string", "examples": ["x"]}}, "$schema": "x"}),
        }]);
        let tools = build_tools(&request);
        let declarations = tools[0]["functionDeclarations"].as_array().unwrap();
        assert!(declarations[0]["parameters"].get("$schema").is_none());
        assert_eq!(declarations[0]["parameters"]["properties"]["q"]["type"], "string");
    }
}
