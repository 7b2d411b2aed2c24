pub mod claude;
pub mod sse;

pub use claude::encoder::{EncoderError, StreamEncoder};
pub use claude::types::{
    ContentBlock, ImageSource, Message, MessageRole, Request, StopReason, SystemPrompt, Tool,
};
