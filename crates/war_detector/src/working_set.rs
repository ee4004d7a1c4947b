use std::collections::HashSet;

use core_types::TargetId;
use parking_lot::Mutex;

/// Targets currently in a tracked, not-yet-finalized war. Shared by the
/// detector (claims) and the finalizer (releases).
#[derive(Debug, Default)]
pub struct InWarSet {
    inner: Mutex<HashSet<TargetId>>,
}

impl InWarSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner.lock().contains(tag)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Adds both participants in one step. Returns `false` when both were
    /// already present, i.e. the war is already being tracked.
    pub fn claim_pair(&self, tag: &str, opponent: &str) -> bool {
        let mut set = self.inner.lock();
        let fresh_tag = set.insert(tag.to_string());
        let fresh_opponent = set.insert(opponent.to_string());
        fresh_tag || fresh_opponent
    }

    pub fn release_pair(&self, tag: &str, opponent: &str) {
        let mut set = self.inner.lock();
        set.remove(tag);
        set.remove(opponent);
    }

    /// Drops duplicates and every target currently in a tracked war.
    pub fn eligible(&self, targets: impl IntoIterator<Item = TargetId>) -> Vec<TargetId> {
        let set = self.inner.lock();
        let mut seen = HashSet::new();
        targets
            .into_iter()
            .filter(|t| !set.contains(t) && seen.insert(t.clone()))
            .collect()
    }
}
