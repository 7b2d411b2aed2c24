//! A cached `wreq` client per provider. `wreq` is the teacher's
//! TLS-fingerprint-aware fork of reqwest: both the Codex and Gemini CLI
//! backends sit behind bot-fingerprint checks that a stock HTTP client
//! trips, so every adapter goes through this rather than building its own
//! client ad hoc.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

static CLIENT_CACHE: OnceLock<Mutex<HashMap<&'static str, wreq::Client>>> = OnceLock::new();

pub fn client_for(provider: &'static str) -> wreq::Client {
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().expect("http client cache lock poisoned");
    if let Some(client) = guard.get(provider) {
        return client.clone();
    }
    let client = wreq::Client::builder()
        .build()
        .expect("failed to build http client");
    guard.insert(provider, client.clone());
    client
}
