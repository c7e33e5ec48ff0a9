// Bounded Cache
// Hierarchical key/value store scoped by (instance, session, scope, key).
// Other components memoize derived values here and rely on the scoped clear
// operations to drop per-session state on eviction.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Owner coordinate for the instance and session levels. Entries that are not
/// tied to a specific instance or session live under `Global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheOwner {
    Global,
    Id(String),
}

impl CacheOwner {
    pub fn id(id: impl Into<String>) -> Self {
        CacheOwner::Id(id.into())
    }
}

impl From<&str> for CacheOwner {
    fn from(id: &str) -> Self {
        CacheOwner::Id(id.to_string())
    }
}

type ScopeMap = HashMap<String, HashMap<String, Value>>;
type SessionMap = HashMap<CacheOwner, ScopeMap>;
type InstanceMap = HashMap<CacheOwner, SessionMap>;

/// In-memory scoped cache. All internal maps are private; external code goes
/// through the typed operations so empty buckets can be pruned eagerly and
/// the structure never retains dangling empty maps.
#[derive(Default)]
pub struct ScopedCache {
    store: RwLock<InstanceMap>,
}

impl ScopedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        instance: CacheOwner,
        session: CacheOwner,
        scope: &str,
        key: &str,
        value: Value,
    ) {
        let mut store = self.store.write().unwrap();
        store
            .entry(instance)
            .or_default()
            .entry(session)
            .or_default()
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(
        &self,
        instance: &CacheOwner,
        session: &CacheOwner,
        scope: &str,
        key: &str,
    ) -> Option<Value> {
        let store = self.store.read().unwrap();
        store
            .get(instance)?
            .get(session)?
            .get(scope)?
            .get(key)
            .cloned()
    }

    /// Memoization helper: return the cached value or compute, store, and
    /// return it.
    pub fn get_or_insert_with<F>(
        &self,
        instance: CacheOwner,
        session: CacheOwner,
        scope: &str,
        key: &str,
        compute: F,
    ) -> Value
    where
        F: FnOnce() -> Value,
    {
        if let Some(hit) = self.get(&instance, &session, scope, key) {
            return hit;
        }
        let value = compute();
        self.insert(instance, session, scope, key, value.clone());
        value
    }

    pub fn remove(
        &self,
        instance: &CacheOwner,
        session: &CacheOwner,
        scope: &str,
        key: &str,
    ) -> Option<Value> {
        let mut store = self.store.write().unwrap();
        let sessions = store.get_mut(instance)?;
        let scopes = sessions.get_mut(session)?;
        let entries = scopes.get_mut(scope)?;
        let removed = entries.remove(key);

        // Prune now-empty buckets bottom-up
        if entries.is_empty() {
            scopes.remove(scope);
        }
        if scopes.is_empty() {
            sessions.remove(session);
        }
        if sessions.is_empty() {
            store.remove(instance);
        }
        removed
    }

    pub fn clear_scope(&self, instance: &CacheOwner, session: &CacheOwner, scope: &str) {
        let mut store = self.store.write().unwrap();
        if let Some(sessions) = store.get_mut(instance) {
            if let Some(scopes) = sessions.get_mut(session) {
                scopes.remove(scope);
                if scopes.is_empty() {
                    sessions.remove(session);
                }
            }
            if sessions.is_empty() {
                store.remove(instance);
            }
        }
    }

    /// Drop every entry held for `session` under `instance`. This is the
    /// cleanup hook the working-set cache runs on eviction.
    pub fn clear_session(&self, instance: &CacheOwner, session: &str) {
        let mut store = self.store.write().unwrap();
        if let Some(sessions) = store.get_mut(instance) {
            sessions.remove(&CacheOwner::id(session));
            if sessions.is_empty() {
                store.remove(instance);
            }
        }
    }

    pub fn clear_instance(&self, instance: &CacheOwner) {
        self.store.write().unwrap().remove(instance);
    }

    pub fn clear_all(&self) {
        self.store.write().unwrap().clear();
    }

    /// Total number of leaf entries, across all buckets.
    pub fn len(&self) -> usize {
        let store = self.store.read().unwrap();
        store
            .values()
            .flat_map(|sessions| sessions.values())
            .flat_map(|scopes| scopes.values())
            .map(|entries| entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().unwrap().is_empty()
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.store.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner(id: &str) -> CacheOwner {
        CacheOwner::id(id)
    }

    #[test]
    fn insert_get_roundtrip() {
        let cache = ScopedCache::new();
        cache.insert(owner("w1"), owner("s1"), "measure", "line-42", json!(17));
        assert_eq!(
            cache.get(&owner("w1"), &owner("s1"), "measure", "line-42"),
            Some(json!(17))
        );
        assert_eq!(cache.get(&owner("w1"), &owner("s1"), "measure", "other"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn global_and_instance_entries_do_not_collide() {
        let cache = ScopedCache::new();
        cache.insert(CacheOwner::Global, owner("s1"), "render", "k", json!("g"));
        cache.insert(owner("w1"), owner("s1"), "render", "k", json!("i"));
        assert_eq!(
            cache.get(&CacheOwner::Global, &owner("s1"), "render", "k"),
            Some(json!("g"))
        );
        assert_eq!(
            cache.get(&owner("w1"), &owner("s1"), "render", "k"),
            Some(json!("i"))
        );
    }

    #[test]
    fn remove_prunes_empty_buckets() {
        let cache = ScopedCache::new();
        cache.insert(owner("w1"), owner("s1"), "measure", "k", json!(1));
        assert_eq!(cache.bucket_count(), 1);

        cache.remove(&owner("w1"), &owner("s1"), "measure", "k");
        assert!(cache.is_empty());
        assert_eq!(cache.bucket_count(), 0);
    }

    #[test]
    fn clear_session_drops_all_scopes_for_that_session() {
        let cache = ScopedCache::new();
        cache.insert(owner("w1"), owner("s1"), "measure", "a", json!(1));
        cache.insert(owner("w1"), owner("s1"), "render", "b", json!(2));
        cache.insert(owner("w1"), owner("s2"), "render", "c", json!(3));

        cache.clear_session(&owner("w1"), "s1");

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&owner("w1"), &owner("s2"), "render", "c"),
            Some(json!(3))
        );
    }

    #[test]
    fn clear_instance_and_clear_all() {
        let cache = ScopedCache::new();
        cache.insert(owner("w1"), owner("s1"), "x", "k", json!(1));
        cache.insert(owner("w2"), owner("s2"), "x", "k", json!(2));

        cache.clear_instance(&owner("w1"));
        assert_eq!(cache.len(), 1);

        cache.clear_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn get_or_insert_with_computes_once() {
        let cache = ScopedCache::new();
        let mut calls = 0;
        let first = cache.get_or_insert_with(owner("w1"), owner("s1"), "m", "k", || {
            calls += 1;
            json!("computed")
        });
        assert_eq!(first, json!("computed"));

        let second = cache.get_or_insert_with(owner("w1"), owner("s1"), "m", "k", || {
            calls += 1;
            json!("recomputed")
        });
        assert_eq!(second, json!("computed"));
        assert_eq!(calls, 1);
    }
}
