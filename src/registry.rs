//! Bookkeeping for in-flight and schema-blocked requests.

use crate::request::PendingRequest;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// A record lives in exactly one of the two sets: `inflight` once its bytes
/// were accepted by the write path, `delayed` while it waits for schema
/// readiness or a schema upgrade. The delayed set is keyed by sync-id so a
/// refresh drains the oldest requests first.
pub(crate) struct Registry {
    inflight: FxHashMap<u64, PendingRequest>,
    delayed: BTreeMap<u64, PendingRequest>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inflight: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            delayed: BTreeMap::new(),
        }
    }

    pub fn insert_inflight(&mut self, rec: PendingRequest) {
        self.inflight.insert(rec.sync, rec);
    }

    pub fn remove_inflight(&mut self, sync: u64) -> Option<PendingRequest> {
        self.inflight.remove(&sync)
    }

    pub fn delay(&mut self, rec: PendingRequest) {
        self.delayed.insert(rec.sync, rec);
    }

    pub fn take_delayed(&mut self, sync: u64) -> Option<PendingRequest> {
        self.delayed.remove(&sync)
    }

    /// Drains the delayed queue in ascending sync-id order.
    pub fn drain_delayed(&mut self) -> Vec<PendingRequest> {
        let delayed = std::mem::take(&mut self.delayed);
        delayed.into_values().collect()
    }

    /// Empties both sets; used when the connection dies.
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        let mut out: Vec<PendingRequest> = self.inflight.drain().map(|(_, r)| r).collect();
        out.extend(std::mem::take(&mut self.delayed).into_values());
        out
    }

    #[cfg(test)]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    #[cfg(test)]
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::request::Request;

    fn rec(sync: u64) -> PendingRequest {
        PendingRequest::begin(Request::ping(), sync, &ClientConfig::default()).0
    }

    #[tokio::test]
    async fn test_sets_are_disjoint() {
        let mut registry = Registry::with_capacity(16);
        registry.insert_inflight(rec(1));
        registry.delay(rec(2));
        assert!(registry.remove_inflight(2).is_none());
        assert!(registry.take_delayed(1).is_none());
        assert_eq!(registry.inflight_len(), 1);
        assert_eq!(registry.delayed_len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_drains_oldest_first() {
        let mut registry = Registry::with_capacity(16);
        for sync in [5u64, 2, 9, 1] {
            registry.delay(rec(sync));
        }
        let order: Vec<u64> = registry.drain_delayed().iter().map(|r| r.sync).collect();
        assert_eq!(order, vec![1, 2, 5, 9]);
        assert_eq!(registry.delayed_len(), 0);
    }

    #[tokio::test]
    async fn test_drain_all_empties_both() {
        let mut registry = Registry::with_capacity(16);
        registry.insert_inflight(rec(1));
        registry.insert_inflight(rec(2));
        registry.delay(rec(3));
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.inflight_len(), 0);
        assert_eq!(registry.delayed_len(), 0);
    }
}
