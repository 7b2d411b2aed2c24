//! Dispatch orchestration (§4.9 steps 1-6): the one place that glues the
//! router (C1), the active-selection cell (§3), the vision fallback (C8),
//! and whichever adapter (C6/C7) the router resolved to, for one request.

use std::sync::Arc;

use gproxy_protocol::claude::types::Request as CanonicalRequest;
use gproxy_provider_core::{
    ActiveSelectionCell, BodyStream, DispatchContext, ProviderError, ProviderRegistry,
    ProviderResult, Selection, VisionCache, parse_model,
};
use gproxy_provider_impl::VisionFallback;

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    active_selection: Arc<ActiveSelectionCell>,
    vision: VisionFallback,
}

/// What the gateway needs back from one dispatch to log it and to decide
/// how to label the downstream error JSON if `stream` itself failed.
pub struct DispatchOutcome {
    pub selection: Selection,
    pub trace_id: String,
    pub body: BodyStream,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        active_selection: Arc<ActiveSelectionCell>,
        vision_cache: Arc<VisionCache>,
        credentials: Arc<dyn gproxy_provider_core::CredentialStore>,
    ) -> Self {
        Self {
            registry,
            active_selection,
            vision: VisionFallback::new(credentials, vision_cache),
        }
    }

    /// Runs §4.9 steps 2-6. Step 1 (body parsing) and step 7 (header
    /// flushing around the returned stream) are the HTTP gateway's job —
    /// this only covers what is common to every transport.
    pub async fn dispatch(&self, mut request: CanonicalRequest) -> ProviderResult<DispatchOutcome> {
        let trace_id = gproxy_common::new_trace_id();
        let default_selection = self.active_selection.get();
        let selection = parse_model(&request.model, default_selection.as_ref());

        // §3 invariant 4: the write happens before any suspension point in
        // this dispatch (no `.await` between here and the write), so no
        // other request can observe a torn or interleaved update.
        if !selection.provider.is_passthrough() {
            self.active_selection.set(selection.clone());
        }

        let provider = self.registry.get(selection.provider).ok_or_else(|| {
            ProviderError::Config(format!("no adapter registered for {}", selection.provider))
        })?;

        let ctx = DispatchContext {
            trace_id: trace_id.clone(),
            model: selection.model.clone(),
            reasoning: selection.reasoning,
        };

        provider.ensure_ready(&ctx).await?;

        if !selection.provider.supports_images() {
            self.vision.apply(&mut request).await;
        }

        request.model = selection.model.clone();
        let body = provider.stream(request, ctx).await?;

        Ok(DispatchOutcome { selection, trace_id, body })
    }
}
