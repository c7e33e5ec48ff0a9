// Session Working-Set Cache
// Bounds how many sessions keep their message state hot. Everything outside
// the retained set is queued for eviction and finalized only once it is
// confirmed to still be outside the set, so rapid session switching does not
// evict a session the user just came back to.

use crate::backend::MessageStore;
use crate::cache::{CacheOwner, ScopedCache};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    /// Retained ids, priority (parent/active) first
    retained: Vec<String>,
    /// Ids awaiting eviction, in the order they left the retained set
    pending_evictions: VecDeque<String>,
}

/// Working set of one instance's sessions.
pub struct WorkingSet {
    instance_id: String,
    limit: usize,
    inner: RwLock<Inner>,
    cache: Arc<ScopedCache>,
    store: Arc<dyn MessageStore>,
}

impl WorkingSet {
    pub fn new(
        instance_id: impl Into<String>,
        limit: usize,
        cache: Arc<ScopedCache>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            limit,
            inner: RwLock::new(Inner::default()),
            cache,
            store,
        }
    }

    /// Recompute the retained set from the current parent and active session
    /// ids. Dropped ids are scheduled for eviction, never evicted inside this
    /// call; the sync bridge drains the queue on its next tick.
    pub async fn update(&self, parent_id: Option<&str>, active_id: Option<&str>) {
        let mut priority: Vec<String> = Vec::new();
        for id in [parent_id, active_id].into_iter().flatten() {
            if !priority.iter().any(|p| p == id) {
                priority.push(id.to_string());
            }
        }

        // One extra slot when parent and active are distinct sessions
        let cap = if priority.len() > 1 {
            self.limit + 1
        } else {
            self.limit
        };

        let mut inner = self.inner.write().await;

        let mut target = priority;
        for id in &inner.retained {
            if target.len() >= cap {
                break;
            }
            if !target.iter().any(|t| t == id) {
                target.push(id.clone());
            }
        }
        target.truncate(cap);

        let dropped: Vec<String> = inner
            .retained
            .iter()
            .filter(|id| !target.iter().any(|t| &t == id))
            .cloned()
            .collect();
        for id in dropped {
            if !inner.pending_evictions.contains(&id) {
                tracing::debug!(
                    instance = %self.instance_id,
                    session = %id,
                    "Session left working set, scheduling eviction"
                );
                inner.pending_evictions.push_back(id);
            }
        }

        inner.retained = target;
    }

    /// Drain the eviction queue. Membership is re-checked for every id at
    /// execution time: ids that re-entered the retained set are requeued
    /// instead of evicted (last-write-wins membership check).
    pub async fn run_pending_evictions(&self) {
        let mut inner = self.inner.write().await;
        let mut requeue = VecDeque::new();

        while let Some(id) = inner.pending_evictions.pop_front() {
            if inner.retained.iter().any(|r| r == &id) {
                requeue.push_back(id);
                continue;
            }
            tracing::debug!(
                instance = %self.instance_id,
                session = %id,
                "Evicting session state"
            );
            self.store.clear_session(&id);
            self.cache
                .clear_session(&CacheOwner::id(self.instance_id.clone()), &id);
        }

        inner.pending_evictions = requeue;
    }

    pub async fn retained(&self) -> Vec<String> {
        self.inner.read().await.retained.clone()
    }

    pub async fn is_retained(&self, session_id: &str) -> bool {
        self.inner
            .read()
            .await
            .retained
            .iter()
            .any(|id| id == session_id)
    }

    pub async fn pending_eviction_count(&self) -> usize {
        self.inner.read().await.pending_evictions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryMessageStore, MessageMeta, MessageRole, MessageStatus};
    use serde_json::json;

    fn seed_session(store: &InMemoryMessageStore, session: &str) {
        store.push_message(MessageMeta {
            id: format!("{}-m1", session),
            session_id: session.to_string(),
            role: MessageRole::User,
            status: MessageStatus::Complete,
        });
    }

    fn working_set(limit: usize) -> (WorkingSet, Arc<InMemoryMessageStore>, Arc<ScopedCache>) {
        let store = Arc::new(InMemoryMessageStore::new());
        let cache = Arc::new(ScopedCache::new());
        let ws = WorkingSet::new("w1", limit, cache.clone(), store.clone());
        (ws, store, cache)
    }

    #[tokio::test]
    async fn retained_count_never_exceeds_bound() {
        let (ws, _, _) = working_set(2);

        let sessions = ["s1", "s2", "s3", "s4", "s5"];
        for (i, parent) in sessions.iter().enumerate() {
            let active = sessions[(i + 1) % sessions.len()];
            ws.update(Some(parent), Some(active)).await;
            assert!(ws.retained().await.len() <= 3); // limit + 1, parent != active
        }

        ws.update(Some("s1"), Some("s1")).await;
        assert!(ws.retained().await.len() <= 2); // limit, parent == active
    }

    #[tokio::test]
    async fn parent_and_active_are_always_retained() {
        let (ws, _, _) = working_set(2);

        ws.update(Some("s1"), Some("s2")).await;
        ws.update(Some("s3"), Some("s4")).await;

        assert!(ws.is_retained("s3").await);
        assert!(ws.is_retained("s4").await);
    }

    #[tokio::test]
    async fn eviction_clears_store_and_cache_partitions() {
        let (ws, store, cache) = working_set(1);
        seed_session(&store, "s1");
        seed_session(&store, "s2");
        cache.insert(
            CacheOwner::id("w1"),
            CacheOwner::id("s1"),
            "measure",
            "k",
            json!(1),
        );

        ws.update(Some("s1"), Some("s1")).await;
        ws.update(Some("s2"), Some("s2")).await;
        ws.run_pending_evictions().await;

        assert!(store.session_message_ids("s1").is_empty());
        assert!(!store.session_message_ids("s2").is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn eviction_skipped_when_session_reenters_working_set() {
        let (ws, store, _) = working_set(1);
        seed_session(&store, "s1");

        ws.update(Some("s1"), Some("s1")).await;
        ws.update(Some("s2"), Some("s2")).await; // s1 scheduled
        ws.update(Some("s1"), Some("s1")).await; // user switched right back

        ws.run_pending_evictions().await;

        assert!(!store.session_message_ids("s1").is_empty());
        // Still parked for a later membership check
        assert_eq!(ws.pending_eviction_count().await, 1);
    }

    #[tokio::test]
    async fn requeued_id_is_evicted_once_it_leaves_again() {
        let (ws, store, _) = working_set(1);
        seed_session(&store, "s1");

        ws.update(Some("s1"), Some("s1")).await;
        ws.update(Some("s2"), Some("s2")).await;
        ws.update(Some("s1"), Some("s1")).await;
        ws.run_pending_evictions().await; // skipped, requeued

        ws.update(Some("s3"), Some("s3")).await;
        ws.run_pending_evictions().await;

        assert!(store.session_message_ids("s1").is_empty());
        assert_eq!(ws.pending_eviction_count().await, 0);
    }
}
