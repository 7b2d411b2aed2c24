//! Maps a `ProviderTag` (router output) to the `Provider` implementation
//! that handles it. Built once at startup by `gproxy-core::bootstrap` and
//! shared (read-only) across every request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::Provider;
use crate::router::ProviderTag;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderTag, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.tag(), provider);
    }

    pub fn get(&self, tag: ProviderTag) -> Option<Arc<dyn Provider>> {
        self.providers.get(&tag).cloned()
    }
}
