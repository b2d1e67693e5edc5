//! # Subscription Registry
//!
//! Routes inbound batches to live feeds by subscription id.
//!
//! Entries are added on successful subscribe and removed on termination.
//! A batch that races with removal either finds no entry, or reaches a feed
//! whose state already rejects it; stale feeds never accept records.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::changefeed::{ChangeRecord, FeedChannel, FeedError, FeedResult, SubscriptionId};

/// A routing entry
#[derive(Debug, Clone)]
pub struct Route {
    /// Feed receiving the batches
    pub channel: Arc<FeedChannel>,
    /// Connection the subscription was opened on
    pub epoch: u64,
}

/// Outcome of routing one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The feed accepted this many records
    Delivered(usize),
    /// The feed exists but has ended
    Discarded,
    /// No feed with this id
    Unknown,
}

/// Registry of live feeds
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Routes by subscription id
    by_id: RwLock<HashMap<SubscriptionId, Route>>,

    /// Subscription ids by connection epoch
    by_epoch: RwLock<HashMap<u64, HashSet<SubscriptionId>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read_ids(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, Route>> {
        self.by_id.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_ids(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, Route>> {
        self.by_id.write().unwrap_or_else(|p| p.into_inner())
    }

    fn write_epochs(&self) -> RwLockWriteGuard<'_, HashMap<u64, HashSet<SubscriptionId>>> {
        self.by_epoch.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a feed opened on connection `epoch`
    pub fn register(&self, channel: Arc<FeedChannel>, epoch: u64) -> FeedResult<()> {
        let id = channel.id();
        {
            let mut by_id = self.write_ids();
            if by_id.contains_key(&id) {
                return Err(FeedError::Internal(format!(
                    "subscription {} already registered",
                    id
                )));
            }
            by_id.insert(id, Route { channel, epoch });
        }
        self.write_epochs().entry(epoch).or_default().insert(id);
        Ok(())
    }

    /// Remove a feed's entry
    pub fn remove(&self, id: SubscriptionId) -> Option<Route> {
        let route = self.write_ids().remove(&id)?;

        let mut by_epoch = self.write_epochs();
        if let Some(ids) = by_epoch.get_mut(&route.epoch) {
            ids.remove(&id);
            if ids.is_empty() {
                by_epoch.remove(&route.epoch);
            }
        }
        Some(route)
    }

    /// Hand a batch to the feed registered under `id`
    pub fn route(&self, id: SubscriptionId, records: Vec<ChangeRecord>) -> RouteOutcome {
        // Clone out of the lock; delivery takes the feed's own lock
        let channel = match self.read_ids().get(&id) {
            Some(route) => Arc::clone(&route.channel),
            None => {
                debug!(feed = id, count = records.len(), "batch for unknown subscription");
                return RouteOutcome::Unknown;
            }
        };

        match channel.deliver(records) {
            0 => RouteOutcome::Discarded,
            n => RouteOutcome::Delivered(n),
        }
    }

    /// End one feed with a terminal error and forget it.
    ///
    /// Returns false if no live feed was registered under `id`.
    pub fn fail(&self, id: SubscriptionId, err: FeedError) -> bool {
        match self.remove(id) {
            Some(route) => route.channel.fail(err),
            None => false,
        }
    }

    /// End every feed opened on connection `epoch`
    pub fn fail_epoch(&self, epoch: u64, err: FeedError) -> usize {
        let ids: Vec<SubscriptionId> = self
            .write_epochs()
            .remove(&epoch)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();

        let mut failed = 0;
        for id in ids {
            let route = self.write_ids().remove(&id);
            if let Some(route) = route {
                if route.channel.fail(err.clone()) {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// End every feed
    pub fn fail_all(&self, err: FeedError) -> usize {
        let routes: Vec<Route> = self.write_ids().drain().map(|(_, r)| r).collect();
        self.write_epochs().clear();

        routes
            .into_iter()
            .filter(|route| route.channel.fail(err.clone()))
            .count()
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.read_ids().contains_key(&id)
    }

    /// Registered subscription ids, ascending
    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.read_ids().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Get subscription count
    pub fn len(&self) -> usize {
        self.read_ids().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changefeed::{FeedSettings, FeedState};
    use crate::observability::FeedMetrics;
    use serde_json::json;

    fn channel(id: SubscriptionId) -> Arc<FeedChannel> {
        FeedChannel::new(id, "posts", FeedSettings::default(), Arc::new(FeedMetrics::new()))
    }

    fn batch() -> Vec<ChangeRecord> {
        vec![ChangeRecord::insert(json!({"id": 1}))]
    }

    #[test]
    fn test_register_and_remove() {
        let registry = SubscriptionRegistry::new();
        registry.register(channel(1), 0).unwrap();
        registry.register(channel(2), 0).unwrap();
        assert_eq!(registry.ids(), vec![1, 2]);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.register(channel(1), 0).unwrap();
        assert!(matches!(
            registry.register(channel(1), 0),
            Err(FeedError::Internal(_))
        ));
    }

    #[test]
    fn test_route() {
        let registry = SubscriptionRegistry::new();
        let ch = channel(1);
        registry.register(Arc::clone(&ch), 0).unwrap();

        assert_eq!(registry.route(1, batch()), RouteOutcome::Delivered(1));
        assert_eq!(registry.route(9, batch()), RouteOutcome::Unknown);
    }

    #[test]
    fn test_route_to_ended_feed_discards() {
        let registry = SubscriptionRegistry::new();
        let ch = channel(1);
        registry.register(Arc::clone(&ch), 0).unwrap();

        // Feed ended but the entry is still present (removal in flight)
        ch.fail(FeedError::ResourceGone("posts".into()));
        assert_eq!(registry.route(1, batch()), RouteOutcome::Discarded);
    }

    #[test]
    fn test_fail_removes_entry() {
        let registry = SubscriptionRegistry::new();
        let ch = channel(1);
        registry.register(Arc::clone(&ch), 0).unwrap();

        assert!(registry.fail(1, FeedError::ResourceGone("posts".into())));
        assert!(!registry.contains(1));
        assert_eq!(ch.state(), FeedState::Errored);
        assert!(!registry.fail(1, FeedError::ResourceGone("posts".into())));
    }

    #[test]
    fn test_fail_epoch_only_touches_that_connection() {
        let registry = SubscriptionRegistry::new();
        let old = channel(1);
        let new = channel(2);
        registry.register(Arc::clone(&old), 1).unwrap();
        registry.register(Arc::clone(&new), 2).unwrap();

        let failed = registry.fail_epoch(1, FeedError::ConnectionError("lost".into()));
        assert_eq!(failed, 1);
        assert_eq!(old.state(), FeedState::Errored);
        assert_eq!(new.state(), FeedState::Open);
        assert_eq!(registry.ids(), vec![2]);
    }

    #[test]
    fn test_fail_all() {
        let registry = SubscriptionRegistry::new();
        for id in 1..=3 {
            registry.register(channel(id), id % 2).unwrap();
        }

        assert_eq!(registry.fail_all(FeedError::ConnectionError("closed".into())), 3);
        assert!(registry.is_empty());
    }
}
