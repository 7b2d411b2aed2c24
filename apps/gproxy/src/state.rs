use std::sync::Arc;

use gproxy_core::Gateway;
use gproxy_provider_core::{ActiveSelectionCell, CredentialStore};
use gproxy_provider_impl::{CodexOAuth, GeminiOAuth};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub active_selection: Arc<ActiveSelectionCell>,
    pub codex_oauth: Arc<CodexOAuth>,
    pub gemini_oauth: Arc<GeminiOAuth>,
    pub pid: u32,
    pub started_at: i64,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        let gateway = Arc::new(gateway);
        let credentials: Arc<dyn CredentialStore> = gateway.credentials.clone();
        Self {
            active_selection: gateway.active_selection.clone(),
            codex_oauth: Arc::new(CodexOAuth::new(credentials.clone())),
            gemini_oauth: Arc::new(GeminiOAuth::new(credentials)),
            gateway,
            pid: std::process::id(),
            started_at: gproxy_common::now_millis(),
        }
    }
}
