//! Wires together config loading (§4.2/§6), the credential store, the
//! provider registry (one adapter per `ProviderTag`, §4.6/§4.7), and the
//! shared process-scoped state (§3, §5) into the collaborators
//! `apps/gproxy` needs to run the HTTP gateway.

use std::path::PathBuf;
use std::sync::Arc;

use gproxy_provider_core::{ActiveSelectionCell, CredentialStore, ProviderRegistry, VisionCache};
use gproxy_provider_impl::{
    CodexResponsesProvider, GeminiProvider, OpenAiChatProvider, PassthroughProvider,
};

use crate::config::{load_env_file, resolve_config_dir};
use crate::credential_store::FileCredentialStore;
use crate::dispatch::Dispatcher;

pub struct GatewayConfig {
    pub config_dir: PathBuf,
    pub port: u16,
}

pub struct Gateway {
    pub config: GatewayConfig,
    pub credentials: Arc<dyn CredentialStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub active_selection: Arc<ActiveSelectionCell>,
}

const DEFAULT_PORT: u16 = 17870;

/// Builds every collaborator from the filesystem (§6) and environment.
/// `config_dir_override`/`port_override` model the CLI flags the binary
/// accepts; both fall back to the dotenv config, then a hardcoded default.
pub fn bootstrap(config_dir_override: Option<&str>, port_override: Option<u16>) -> Gateway {
    let config_dir = resolve_config_dir(config_dir_override);
    let env = load_env_file(&config_dir);

    let port = port_override
        .or_else(|| env.get("CLAUDE_PROXY_PORT").and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_PORT);

    let credentials: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config_dir.clone(), env));

    let mut registry = ProviderRegistry::new();
    register_builtin_providers(&mut registry, credentials.clone());

    let active_selection = Arc::new(ActiveSelectionCell::new());
    let vision_cache = Arc::new(VisionCache::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        active_selection.clone(),
        vision_cache,
        credentials.clone(),
    ));

    Gateway {
        config: GatewayConfig { config_dir, port },
        credentials,
        dispatcher,
        active_selection,
    }
}

fn register_builtin_providers(registry: &mut ProviderRegistry, credentials: Arc<dyn CredentialStore>) {
    registry.register(Arc::new(PassthroughProvider::anthropic(credentials.clone())));
    registry.register(Arc::new(PassthroughProvider::glm(credentials.clone())));
    registry.register(Arc::new(OpenAiChatProvider::openai_key(credentials.clone())));
    registry.register(Arc::new(OpenAiChatProvider::openrouter(credentials.clone())));
    registry.register(Arc::new(GeminiProvider::api_key(credentials.clone())));
    registry.register(Arc::new(GeminiProvider::workspace_oauth(credentials.clone())));
    registry.register(Arc::new(CodexResponsesProvider::new(credentials)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_registers_all_seven_provider_tags() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = bootstrap(Some(dir.path().to_str().unwrap()), Some(18080));
        assert_eq!(gateway.config.port, 18080);
        assert_eq!(gateway.config.config_dir, dir.path());
    }
}
