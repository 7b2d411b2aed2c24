pub mod codex_responses;
pub mod gemini;
pub mod gemini_oauth;
pub mod codex_oauth;
pub mod openai_chat;
pub mod passthrough;
pub mod schema_sanitizer;
