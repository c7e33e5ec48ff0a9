// Taskdeck Application State
// Explicit registry object owned by the embedding application and passed by
// reference to everything that needs it. No module-scope globals: two
// DeckStates are fully independent.

use crate::autonomy::AutonomyController;
use crate::backend::{FileAttachment, MessageStore, SessionBackend};
use crate::cache::ScopedCache;
use crate::config::DeckConfig;
use crate::error::Result;
use crate::sync::{BridgeDeps, SyncBridge};
use crate::tasks::TaskRegistry;
use crate::working_set::WorkingSet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::RwLock;

/// Which sessions currently have the user's attention in one instance.
#[derive(Default)]
pub struct Focus {
    parent_session: StdRwLock<Option<String>>,
}

impl Focus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent_session(&self) -> Option<String> {
        self.parent_session.read().unwrap().clone()
    }

    pub fn set_parent_session(&self, session_id: Option<String>) {
        *self.parent_session.write().unwrap() = session_id;
    }
}

/// Per-session "a send is in flight" flags. Cleared unconditionally after
/// every dispatch attempt and force-clearable, so the view state machine can
/// never get permanently stuck waiting on a backend that went away.
#[derive(Default)]
pub struct BusyFlags {
    busy: StdRwLock<HashSet<String>>,
}

impl BusyFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session_id: &str) {
        self.busy.write().unwrap().insert(session_id.to_string());
    }

    pub fn clear(&self, session_id: &str) {
        self.busy.write().unwrap().remove(session_id);
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.busy.read().unwrap().contains(session_id)
    }
}

/// Handles for one instance (one backend agent process bound to a workspace).
pub struct InstanceHandles {
    pub instance_id: String,
    pub working_set: Arc<WorkingSet>,
    pub focus: Arc<Focus>,
    pub busy: Arc<BusyFlags>,
    pub bridge: Arc<SyncBridge>,
}

/// Main application state: configuration, the shared components, and the
/// per-instance handles created lazily on first access.
pub struct DeckState {
    pub config: DeckConfig,
    pub cache: Arc<ScopedCache>,
    pub store: Arc<dyn MessageStore>,
    pub backend: Arc<dyn SessionBackend>,
    pub registry: Arc<TaskRegistry>,
    pub autonomy: Arc<AutonomyController>,
    instances: RwLock<HashMap<String, Arc<InstanceHandles>>>,
}

impl DeckState {
    pub fn new(
        config: DeckConfig,
        backend: Arc<dyn SessionBackend>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            cache: Arc::new(ScopedCache::new()),
            store,
            backend,
            registry: Arc::new(TaskRegistry::new()),
            autonomy: Arc::new(AutonomyController::new(config.clone())),
            instances: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or lazily create the handles for `instance_id`.
    pub async fn instance(&self, instance_id: &str) -> Arc<InstanceHandles> {
        {
            let instances = self.instances.read().await;
            if let Some(existing) = instances.get(instance_id) {
                return existing.clone();
            }
        }

        let mut instances = self.instances.write().await;
        // Re-check under the write lock; another caller may have won the race
        if let Some(existing) = instances.get(instance_id) {
            return existing.clone();
        }

        let handles = Arc::new(InstanceHandles {
            instance_id: instance_id.to_string(),
            working_set: Arc::new(WorkingSet::new(
                instance_id,
                self.config.working_set_limit,
                self.cache.clone(),
                self.store.clone(),
            )),
            focus: Arc::new(Focus::new()),
            busy: Arc::new(BusyFlags::new()),
            bridge: Arc::new(SyncBridge::new(&self.config)),
        });
        instances.insert(instance_id.to_string(), handles.clone());
        handles
    }

    /// Start the sync bridge for an instance.
    pub async fn start_instance(&self, instance_id: &str) -> Result<Arc<InstanceHandles>> {
        let handles = self.instance(instance_id).await;
        let deps = BridgeDeps {
            instance_id: instance_id.to_string(),
            registry: self.registry.clone(),
            autonomy: self.autonomy.clone(),
            working_set: handles.working_set.clone(),
            store: self.store.clone(),
            focus: handles.focus.clone(),
            busy: handles.busy.clone(),
        };
        handles.bridge.start(deps).await?;
        Ok(handles)
    }

    pub async fn shutdown(&self) {
        let instances = self.instances.read().await;
        for handles in instances.values() {
            handles.bridge.stop().await;
        }
    }

    /// Dispatch a message. The session's busy flag is set for the duration of
    /// the call and cleared unconditionally, success or failure.
    pub async fn send_message(
        &self,
        instance_id: &str,
        session_id: &str,
        text: &str,
        attachments: &[FileAttachment],
        task_id: Option<&str>,
    ) -> Result<()> {
        let handles = self.instance(instance_id).await;
        handles.busy.set(session_id);

        let result = self
            .backend
            .send_message(instance_id, session_id, text, attachments, task_id)
            .await;

        handles.busy.clear(session_id);
        if let Err(e) = &result {
            tracing::error!(
                instance = instance_id,
                session = session_id,
                "Message dispatch failed: {}",
                e
            );
        }
        result
    }

    /// Best-effort stop. The busy flag is cleared on our own decision; the
    /// cancel acknowledgement is not guaranteed to arrive.
    pub async fn stop_generation(&self, instance_id: &str, session_id: &str) {
        let handles = self.instance(instance_id).await;
        handles.busy.clear(session_id);

        let backend = self.backend.clone();
        let instance = instance_id.to_string();
        let session = session_id.to_string();
        tokio::spawn(async move {
            backend.cancel(&instance, &session).await;
        });
    }

    /// Escape hatch for a stuck busy flag.
    pub async fn force_reset_busy(&self, instance_id: &str, session_id: &str) {
        let handles = self.instance(instance_id).await;
        handles.busy.clear(session_id);
    }

    pub async fn retained_sessions(&self, instance_id: &str) -> Vec<String> {
        self.instance(instance_id).await.working_set.retained().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;
    use crate::backend::InMemoryMessageStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn deck_with_stub() -> (DeckState, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend::new());
        let deck = DeckState::new(
            DeckConfig::default(),
            backend.clone(),
            Arc::new(InMemoryMessageStore::new()),
        );
        (deck, backend)
    }

    #[tokio::test]
    async fn instance_handles_are_created_once() {
        let (deck, _) = deck_with_stub();
        let a = deck.instance("w1").await;
        let b = deck.instance("w1").await;
        assert!(Arc::ptr_eq(&a, &b));

        let other = deck.instance("w2").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn busy_flag_cleared_after_successful_send() {
        let (deck, backend) = deck_with_stub();
        deck.send_message("w1", "s1", "hello", &[], None)
            .await
            .unwrap();

        let handles = deck.instance("w1").await;
        assert!(!handles.busy.is_busy("s1"));
        assert_eq!(backend.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn busy_flag_cleared_after_failed_send() {
        let (deck, backend) = deck_with_stub();
        backend.fail_sends.store(true, Ordering::SeqCst);

        let result = deck.send_message("w1", "s1", "hello", &[], None).await;
        assert!(result.is_err());

        let handles = deck.instance("w1").await;
        assert!(!handles.busy.is_busy("s1"));
    }

    #[tokio::test]
    async fn stop_generation_clears_busy_and_fires_cancel() {
        let (deck, backend) = deck_with_stub();
        let handles = deck.instance("w1").await;
        handles.busy.set("s1");

        deck.stop_generation("w1", "s1").await;
        assert!(!handles.busy.is_busy("s1"));

        // The cancel itself is fire-and-forget on a spawned task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.cancelled.lock().unwrap().as_slice(), ["s1"]);
    }
}
