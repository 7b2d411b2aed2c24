//! The `Provider` trait every adapter (C6/C7) implements, plus the small
//! per-request context threaded through a dispatch.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use gproxy_protocol::claude::types::Request;

use crate::errors::ProviderResult;
use crate::router::{ProviderTag, ReasoningLevel};

#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub trace_id: String,
    pub model: String,
    pub reasoning: Option<ReasoningLevel>,
}

pub type BodyStream = BoxStream<'static, Bytes>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    /// Checks (and, for OAuth providers, refreshes) whatever credentials
    /// this provider needs, without opening the main upstream call.
    /// Failing here is what produces a pre-stream JSON 401/500 (§4.9 step
    /// 4) rather than a mid-stream synthetic error block.
    async fn ensure_ready(&self, ctx: &DispatchContext) -> ProviderResult<()>;

    /// Translates `request` to the upstream's native schema, opens the
    /// streaming call, and returns a stream of already Protocol-A-encoded
    /// SSE byte chunks (§4.4, §4.5). Errors that occur after the stream
    /// has started are folded into the stream itself as a synthetic error
    /// block (§7) rather than returned here.
    async fn stream(&self, request: Request, ctx: DispatchContext) -> ProviderResult<BodyStream>;
}
