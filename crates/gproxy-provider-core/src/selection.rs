//! The active-selection cell (§3): the process-scoped memory of the last
//! non-passthrough `(provider, model, reasoning)` dispatch. A single
//! `arc-swap`-free `Mutex<Option<Selection>>` is enough here: the write
//! happens synchronously before any suspension point in the dispatch path
//! (§3 invariant 4), so there is no risk of another request observing a
//! torn or interleaved update.

use std::sync::Mutex;

use crate::router::Selection;

#[derive(Default)]
pub struct ActiveSelectionCell {
    inner: Mutex<Option<Selection>>,
}

impl ActiveSelectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Selection> {
        self.inner.lock().expect("active selection lock poisoned").clone()
    }

    /// Overwrites the cell. Callers must not call this for a passthrough
    /// dispatch (§3 invariant 4) — `gproxy-core`'s dispatch path enforces
    /// that by only calling `set` for non-passthrough selections.
    pub fn set(&self, selection: Selection) {
        *self.inner.lock().expect("active selection lock poisoned") = Some(selection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ProviderTag, ReasoningLevel};

    #[test]
    fn starts_empty_and_reflects_last_write() {
        let cell = ActiveSelectionCell::new();
        assert!(cell.get().is_none());
        cell.set(Selection {
            provider: ProviderTag::CodexOAuth,
            model: "gpt-5.3-codex".to_string(),
            reasoning: Some(ReasoningLevel::High),
        });
        let got = cell.get().unwrap();
        assert_eq!(got.provider, ProviderTag::CodexOAuth);
        assert_eq!(got.model, "gpt-5.3-codex");
    }
}
