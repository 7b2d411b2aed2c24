//! The Protocol-A SSE grammar encoder (§4.5). Every adapter drives this
//! state machine rather than hand-emitting events, so the invariants
//! (monotonic indices, balanced open/close, lazily-emitted `message_start`,
//! graceful termination on error) hold regardless of which upstream is
//! behind it.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::claude::types::StopReason;
use crate::sse::frame_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Thinking,
    Text,
    ToolUse,
}

#[derive(Debug)]
pub struct StreamEncoder {
    message_id: String,
    model: String,
    message_started: bool,
    next_index: u32,
    open: Option<OpenBlock>,
    tool_args_buffer: String,
    finished: bool,
}

#[derive(Debug, Clone)]
pub struct EncoderError(pub String);

impl std::fmt::Display for EncoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream encoder error: {}", self.0)
    }
}
impl std::error::Error for EncoderError {}

fn sse(event: &str, payload: impl Serialize) -> Bytes {
    let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    frame_event(event, &data)
}

impl StreamEncoder {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            message_started: false,
            next_index: 0,
            open: None,
            tool_args_buffer: String::new(),
            finished: false,
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        out.push(sse(
            "message_start",
            serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": JsonValue::Null,
                    "stop_sequence": JsonValue::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        ));
    }

    fn close_open_block(&mut self, out: &mut Vec<Bytes>) {
        let Some(_open) = self.open.take() else {
            return;
        };
        let index = self.next_index;
        out.push(sse(
            "content_block_stop",
            serde_json::json!({"type": "content_block_stop", "index": index}),
        ));
        self.next_index += 1;
        self.tool_args_buffer.clear();
    }

    /// Opens (or continues) the `thinking` block. A `thinking` block must
    /// precede any `text` block at the same logical position, so the
    /// caller is expected to call this before `push_text_delta`.
    pub fn push_thinking_delta(&mut self, text: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if self.open != Some(OpenBlock::Thinking) {
            self.close_open_block(&mut out);
            out.push(sse(
                "content_block_start",
                serde_json::json!({
                    "type": "content_block_start",
                    "index": self.next_index,
                    "content_block": {"type": "thinking", "thinking": ""},
                }),
            ));
            self.open = Some(OpenBlock::Thinking);
        }
        out.push(sse(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": self.next_index,
                "delta": {"type": "thinking_delta", "thinking": text},
            }),
        ));
        out
    }

    /// Opening a `text` block while a `thinking` block is open auto-closes
    /// the thinking block first (§4.5).
    pub fn push_text_delta(&mut self, text: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if self.open != Some(OpenBlock::Text) {
            self.close_open_block(&mut out);
            out.push(sse(
                "content_block_start",
                serde_json::json!({
                    "type": "content_block_start",
                    "index": self.next_index,
                    "content_block": {"type": "text", "text": ""},
                }),
            ));
            self.open = Some(OpenBlock::Text);
        }
        out.push(sse(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": self.next_index,
                "delta": {"type": "text_delta", "text": text},
            }),
        ));
        out
    }

    /// `tool_use` blocks come after any text block and each occupies its
    /// own index (§4.5); a new call always closes whatever was open.
    pub fn start_tool_use(&mut self, id: &str, name: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_block(&mut out);
        out.push(sse(
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start",
                "index": self.next_index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
            }),
        ));
        self.open = Some(OpenBlock::ToolUse);
        self.tool_args_buffer.clear();
        out
    }

    pub fn push_tool_input_delta(&mut self, partial_json: &str) -> Vec<Bytes> {
        if self.open != Some(OpenBlock::ToolUse) {
            return Vec::new();
        }
        self.tool_args_buffer.push_str(partial_json);
        vec![sse(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": self.next_index,
                "delta": {"type": "input_json_delta", "partial_json": partial_json},
            }),
        )]
    }

    /// Closes whichever block is currently open, if any. The accumulated
    /// tool-call JSON must be valid at this point (§4.5); callers that
    /// streamed partial JSON validate it themselves before calling this,
    /// since recovery (e.g. substituting `{}`) is adapter-specific.
    pub fn close_current_block(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.close_open_block(&mut out);
        out
    }

    pub fn finish(&mut self, stop_reason: StopReason) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_block(&mut out);
        out.push(sse(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": JsonValue::Null},
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }),
        ));
        out.push(sse("message_stop", serde_json::json!({"type": "message_stop"})));
        self.finished = true;
        out
    }

    /// §4.5 / §7 error path. If `message_start` has not been emitted yet,
    /// the whole response collapses to a single synthetic text block so the
    /// client still sees one well-formed message instead of a broken
    /// half-stream. If it has, a synthetic text block is appended and the
    /// stream is closed out normally.
    pub fn error(&mut self, message: &str) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_block(&mut out);
        out.push(sse(
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start",
                "index": self.next_index,
                "content_block": {"type": "text", "text": ""},
            }),
        ));
        self.open = Some(OpenBlock::Text);
        out.push(sse(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": self.next_index,
                "delta": {"type": "text_delta", "text": message},
            }),
        ));
        out.extend(self.finish(StopReason::EndTurn));
        out
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[Bytes]) -> Vec<(String, JsonValue)> {
        bytes
            .iter()
            .map(|b| {
                let text = std::str::from_utf8(b).unwrap();
                let data_line = text
                    .lines()
                    .find(|line| line.starts_with("data:"))
                    .unwrap();
                let event_line = text.lines().find(|line| line.starts_with("event:")).unwrap();
                let event = event_line.trim_start_matches("event:").trim().to_string();
                let data: JsonValue = serde_json::from_str(data_line.trim_start_matches("data:").trim()).unwrap();
                (event, data)
            })
            .collect()
    }

    #[test]
    fn lazy_message_start_then_text() {
        let mut enc = StreamEncoder::new("msg_1", "glm-4.6");
        let events = decode(&enc.push_text_delta("hi"));
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[1].0, "content_block_start");
        assert_eq!(events[1].1["index"], 0);
        assert_eq!(events[2].0, "content_block_delta");
    }

    #[test]
    fn thinking_auto_closes_before_text() {
        let mut enc = StreamEncoder::new("msg_1", "m");
        enc.push_thinking_delta("hmm");
        let events = decode(&enc.push_text_delta("hi"));
        assert_eq!(events[0].0, "content_block_stop");
        assert_eq!(events[0].1["index"], 0);
        assert_eq!(events[1].0, "content_block_start");
        assert_eq!(events[1].1["index"], 1);
    }

    #[test]
    fn indices_increment_monotonically_across_tool_use() {
        let mut enc = StreamEncoder::new("msg_1", "m");
        enc.push_text_delta("hi");
        let events = decode(&enc.start_tool_use("toolu_1", "search"));
        // close text (idx 0), open tool_use (idx 1)
        assert_eq!(events[0].1["index"], 0);
        assert_eq!(events[1].1["index"], 1);
    }

    #[test]
    fn finish_closes_open_block_and_terminates() {
        let mut enc = StreamEncoder::new("msg_1", "m");
        enc.push_text_delta("hi");
        let events = decode(&enc.finish(StopReason::EndTurn));
        assert_eq!(events[0].0, "content_block_stop");
        assert_eq!(events[1].0, "message_delta");
        assert_eq!(events[2].0, "message_stop");
        assert!(enc.is_finished());
    }

    #[test]
    fn error_before_any_output_yields_single_synthetic_block() {
        let mut enc = StreamEncoder::new("msg_1", "m");
        let events = decode(&enc.error("boom"));
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[1].0, "content_block_start");
        assert_eq!(events[2].0, "content_block_delta");
        assert_eq!(events[2].1["delta"]["text"], "boom");
        assert_eq!(events.last().unwrap().0, "message_stop");
    }

    #[test]
    fn error_after_partial_stream_still_terminates_gracefully() {
        let mut enc = StreamEncoder::new("msg_1", "m");
        enc.push_text_delta("partial");
        let events = decode(&enc.error("[Provider Error] 500"));
        // text block (idx0) closes, error text block (idx1) opens/delta/closes, then message_delta+stop
        assert_eq!(events[0].0, "content_block_stop");
        assert_eq!(events[0].1["index"], 0);
        assert_eq!(events[1].0, "content_block_start");
        assert_eq!(events[1].1["index"], 1);
        assert_eq!(events.last().unwrap().0, "message_stop");
    }
}
