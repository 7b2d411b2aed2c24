//! C8, §4.8: substitutes every `image` block a non-image-capable upstream
//! (currently Codex, §4.1 `ProviderTag::supports_images`) would otherwise
//! choke on with a text description obtained from a vision-capable
//! upstream, memoized by [`VisionCache`] so identical images across (and
//! within) requests only pay for one description call.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value as JsonValue;

use gproxy_protocol::claude::types::{ContentBlock, Message, MessageContent, Request as CanonicalRequest};
use gproxy_provider_core::{CredentialStore, Headers, VisionCache, header_set, vision_cache};

use crate::http_client;

const DEFAULT_VISION_MODEL: &str = "meta-llama/llama-3.2-11b-vision-instruct";
const DESCRIPTION_PROMPT: &str = "Describe this image in granular, literal detail: objects, text, layout, colors. No speculation.";
const UNAVAILABLE_PLACEHOLDER: &str = "[Image description unavailable]";

pub struct VisionFallback {
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<VisionCache>,
}

impl VisionFallback {
    pub fn new(credentials: Arc<dyn CredentialStore>, cache: Arc<VisionCache>) -> Self {
        Self { credentials, cache }
    }

    /// Replaces every image block in `request` in place. Distinct
    /// cache-miss images are described concurrently (§4.8 step c); a
    /// failed description never aborts the request, it just yields the
    /// placeholder text.
    pub async fn apply(&self, request: &mut CanonicalRequest) {
        let keys: Vec<(String, ContentBlock)> = request
            .messages
            .iter()
            .flat_map(|message| message.content.blocks())
            .filter_map(|block| match &block {
                ContentBlock::Image { .. } => Some((cache_key(&block), block)),
                _ => None,
            })
            .collect();

        let mut misses: Vec<(String, ContentBlock)> = Vec::new();
        for (key, block) in keys {
            if self.cache.get(&key).is_none() && !misses.iter().any(|(k, _)| k == &key) {
                misses.push((key, block));
            }
        }

        let descriptions = join_all(misses.iter().map(|(_, block)| self.describe(block))).await;
        for ((key, _), description) in misses.into_iter().zip(descriptions) {
            self.cache.insert(key, description);
        }

        for message in &mut request.messages {
            *message = substitute_message(message, &self.cache);
        }
    }

    async fn describe(&self, block: &ContentBlock) -> String {
        let ContentBlock::Image { source } = block else {
            return UNAVAILABLE_PLACEHOLDER.to_string();
        };
        describe_image(&self.credentials, source).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "vision fallback description failed");
            UNAVAILABLE_PLACEHOLDER.to_string()
        })
    }
}

fn cache_key(block: &ContentBlock) -> String {
    let ContentBlock::Image { source } = block else {
        return String::new();
    };
    if let Some(url) = &source.url {
        return vision_cache::key_for_url(url);
    }
    let media_type = source.media_type.as_deref().unwrap_or("application/octet-stream");
    let data = source.data.as_deref().unwrap_or("");
    vision_cache::key_for_inline(media_type, data)
}

fn substitute_message(message: &Message, cache: &VisionCache) -> Message {
    let blocks = message.content.blocks();
    let had_blocks = matches!(message.content, MessageContent::Blocks(_));
    if !blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })) {
        return message.clone();
    }

    let substituted: Vec<ContentBlock> = blocks
        .into_iter()
        .map(|block| match &block {
            ContentBlock::Image { .. } => {
                let key = cache_key(&block);
                let description = cache.get(&key).unwrap_or_else(|| UNAVAILABLE_PLACEHOLDER.to_string());
                ContentBlock::Text {
                    text: format!("[Image Description: {description}]"),
                }
            }
            other => other.clone(),
        })
        .collect();

    let _ = had_blocks;
    Message {
        role: message.role,
        content: MessageContent::Blocks(substituted),
    }
}

async fn describe_image(
    credentials: &Arc<dyn CredentialStore>,
    source: &gproxy_protocol::claude::types::ImageSource,
) -> Result<String, String> {
    let url = match (&source.url, &source.data, &source.media_type) {
        (Some(url), _, _) => url.clone(),
        (None, Some(data), Some(media_type)) => format!("data:{media_type};base64,{data}"),
        _ => return Err("image block carries neither url nor inline data".to_string()),
    };

    let base_url = credentials
        .get_env("OPENROUTER_BASE_URL")
        .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string());
    let api_key = credentials
        .get_env("OPENROUTER_API_KEY")
        .ok_or_else(|| "OPENROUTER_API_KEY not set".to_string())?;
    let model = credentials.get_env("VISION_MODEL").unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string());

    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "authorization", format!("Bearer {api_key}"));
    header_set(&mut headers, "content-type", "application/json");
    if let Some(referer) = credentials.get_env("OPENROUTER_REFERER") {
        header_set(&mut headers, "HTTP-Referer", referer);
    }
    if let Some(title) = credentials.get_env("OPENROUTER_TITLE") {
        header_set(&mut headers, "X-Title", title);
    }

    let client = http_client::client_for("vision-fallback");
    let mut builder = client.post(format!("{}/chat/completions", base_url.trim_end_matches('/')));
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let body = serde_json::json!({
        "model": model,
        "stream": false,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": DESCRIPTION_PROMPT},
                {"type": "image_url", "image_url": {"url": url}},
            ],
        }],
    });

    let response = builder.json(&body).send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(|err| err.to_string())?;
    if !status.is_success() {
        return Err(format!("vision upstream rejected ({status})"));
    }
    let parsed: JsonValue = serde_json::from_slice(&bytes).map_err(|err| err.to_string())?;
    parsed
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(str::to_string)
        .ok_or_else(|| "vision upstream returned no content".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::claude::types::{ImageSource, ImageSourceKind, MessageRole};

    fn inline_image_block(data: &str) -> ContentBlock {
        ContentBlock::Image {
            source: ImageSource {
                kind: ImageSourceKind::Base64,
                media_type: Some("image/png".to_string()),
                data: Some(data.to_string()),
                url: None,
            },
        }
    }

    #[test]
    fn identical_inline_images_produce_the_same_cache_key() {
        let a = cache_key(&inline_image_block("abc123"));
        let b = cache_key(&inline_image_block("abc123"));
        assert_eq!(a, b);
    }

    #[test]
    fn substitution_leaves_non_image_messages_untouched() {
        let cache = VisionCache::new();
        let message = Message {
            role: MessageRole::User,
            content: MessageContent::Text("hi".to_string()),
        };
        let out = substitute_message(&message, &cache);
        assert_eq!(out, message);
    }

    #[test]
    fn substitution_replaces_image_block_with_memoized_description() {
        let cache = VisionCache::new();
        let block = inline_image_block("abc123");
        cache.insert(cache_key(&block), "a red car".to_string());
        let message = Message {
            role: MessageRole::User,
            content: MessageContent::Blocks(vec![block, ContentBlock::Text { text: "what is this".to_string() }]),
        };
        let out = substitute_message(&message, &cache);
        let blocks = out.content.blocks();
        assert_eq!(
            blocks[0],
            ContentBlock::Text { text: "[Image Description: a red car]".to_string() }
        );
    }

    #[test]
    fn substitution_falls_back_to_placeholder_on_cache_miss() {
        let cache = VisionCache::new();
        let block = inline_image_block("uncached");
        let message = Message { role: MessageRole::User, content: MessageContent::Blocks(vec![block]) };
        let out = substitute_message(&message, &cache);
        assert_eq!(
            out.content.blocks()[0],
            ContentBlock::Text { text: format!("[Image Description: {UNAVAILABLE_PLACEHOLDER}]") }
        );
    }
}
