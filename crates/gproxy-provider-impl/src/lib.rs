pub mod http_client;
pub mod oauth_common;
pub mod providers;
pub mod stream_relay;
pub mod vision;

pub use providers::codex_oauth::CodexOAuth;
pub use providers::codex_responses::CodexResponsesProvider;
pub use providers::gemini::GeminiProvider;
pub use providers::gemini_oauth::GeminiOAuth;
pub use providers::openai_chat::OpenAiChatProvider;
pub use providers::passthrough::PassthroughProvider;
pub use vision::VisionFallback;
