// Task Registry
// Ordered task lists per parent session, each task optionally bound to a
// dedicated child session provisioned at creation time.

use crate::backend::{InheritedSelection, SessionBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Interrupted,
}

/// A tracked unit of work within a parent session's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the parent session, archived tasks included
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Message ids in insertion order, duplicates forbidden
    pub message_ids: Vec<String>,
    /// Dedicated child session; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_session_id: Option<String>,
    /// Soft delete. Archived tasks are never physically removed.
    pub archived: bool,
}

impl Task {
    fn new(id: String, title: String, task_session_id: Option<String>) -> Self {
        Self {
            id,
            title,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now(),
            message_ids: Vec::new(),
            task_session_id,
            archived: false,
        }
    }
}

/// Result of `create_task`. Creation never fails outright: when child-session
/// provisioning fails, `task_session_id` is `None` and the warning carries the
/// reason so the caller can fall back to the parent session.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_warning: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct SessionTasks {
    tasks: Vec<Task>,
    active_task_id: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// parent session id -> its task pipeline
    sessions: HashMap<String, SessionTasks>,
    /// child session id -> owning parent session id. Explicit pointer so
    /// lookups never have to infer ownership from an absent task list.
    session_owner: HashMap<String, String>,
}

/// Owns the task pipelines for every parent session of one instance.
#[derive(Default)]
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task under `parent_session_id`, attempting to provision a
    /// dedicated child session that inherits the parent's agent and model
    /// selection.
    pub async fn create_task(
        &self,
        parent_session_id: &str,
        title: &str,
        backend: &dyn SessionBackend,
        inherited: &InheritedSelection,
    ) -> CreatedTask {
        let task_id = uuid::Uuid::new_v4().to_string();

        let (task_session_id, provisioning_warning) = match backend
            .create_child_session(parent_session_id, inherited)
            .await
        {
            Ok(session_id) => (Some(session_id), None),
            Err(e) => {
                let warning = format!(
                    "Failed to provision task session, falling back to parent session: {}",
                    e
                );
                tracing::warn!(parent = parent_session_id, task = %task_id, "{}", warning);
                (None, Some(warning))
            }
        };

        let mut inner = self.inner.write().await;
        if let Some(child) = &task_session_id {
            inner
                .session_owner
                .insert(child.clone(), parent_session_id.to_string());
        }
        inner
            .sessions
            .entry(parent_session_id.to_string())
            .or_default()
            .tasks
            .push(Task::new(
                task_id.clone(),
                title.to_string(),
                task_session_id.clone(),
            ));

        CreatedTask {
            id: task_id,
            task_session_id,
            provisioning_warning,
        }
    }

    /// Record which task has focus. Existence is not validated here so the
    /// write path never blocks on a lookup; `archive_task` keeps the focus
    /// consistent when tasks go away.
    pub async fn set_active_task(&self, parent_session_id: &str, task_id: Option<String>) {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .entry(parent_session_id.to_string())
            .or_default()
            .active_task_id = task_id;
    }

    pub async fn active_task(&self, parent_session_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(parent_session_id)?
            .active_task_id
            .clone()
    }

    /// Soft-delete a task. Idempotent: archiving an already-archived task only
    /// re-runs the focus clear.
    pub async fn archive_task(&self, parent_session_id: &str, task_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(parent_session_id) else {
            return;
        };
        if let Some(task) = session.tasks.iter_mut().find(|t| t.id == task_id) {
            task.archived = true;
        }
        if session.active_task_id.as_deref() == Some(task_id) {
            session.active_task_id = None;
        }
    }

    pub async fn set_task_status(&self, parent_session_id: &str, task_id: &str, status: TaskStatus) {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .sessions
            .get_mut(parent_session_id)
            .and_then(|s| s.tasks.iter_mut().find(|t| t.id == task_id))
        {
            task.status = status;
        }
    }

    /// Append a message id to the owning task. `target` is either a task id or
    /// a session id; session ids are resolved one level up through the owning
    /// parent. Set-like: an id already present is not duplicated.
    pub async fn append_message(&self, target: &str, message_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        // Direct task-id match first
        for session in inner.sessions.values_mut() {
            if let Some(task) = session.tasks.iter_mut().find(|t| t.id == target) {
                return push_unique(&mut task.message_ids, message_id);
            }
        }

        // Otherwise treat target as a session id owned by some parent
        let parent = inner
            .session_owner
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string());
        if let Some(task) = inner
            .sessions
            .get_mut(&parent)
            .and_then(|s| find_by_session(&mut s.tasks, target))
        {
            return push_unique(&mut task.message_ids, message_id);
        }
        false
    }

    /// Swap a provisional, client-generated message id for the
    /// server-confirmed one. The provisional id pins the owning task;
    /// degraded tasks share the parent session, so a session match alone
    /// would miss them. When `old_id` is absent but the session identifies a
    /// task, `new_id` is appended so no message reference is lost during the
    /// swap.
    pub async fn replace_message_id(&self, session_id: &str, old_id: &str, new_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let parent = inner
            .session_owner
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| session_id.to_string());
        let Some(session) = inner.sessions.get_mut(&parent) else {
            return false;
        };

        for task in session.tasks.iter_mut() {
            if let Some(pos) = task.message_ids.iter().position(|m| m == old_id) {
                if task.message_ids.iter().any(|m| m == new_id) {
                    // Confirmed id already tracked; just drop the provisional one
                    task.message_ids.remove(pos);
                } else {
                    task.message_ids[pos] = new_id.to_string();
                }
                return true;
            }
        }

        if let Some(task) = find_by_session(&mut session.tasks, session_id) {
            return push_unique(&mut task.message_ids, new_id);
        }
        false
    }

    /// Read-only snapshot of the task list for the presentation layer.
    pub async fn tasks_for(&self, parent_session_id: &str) -> Vec<Task> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(parent_session_id)
            .map(|s| s.tasks.clone())
            .unwrap_or_default()
    }

    /// Parent session that owns `session_id`, if it is a registered child.
    pub async fn owner_of(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.session_owner.get(session_id).cloned()
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) -> bool {
    if ids.iter().any(|m| m == id) {
        return false;
    }
    ids.push(id.to_string());
    true
}

fn find_by_session<'a>(tasks: &'a mut [Task], session_id: &str) -> Option<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.task_session_id.as_deref() == Some(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FailingBackend, StubBackend};

    fn inherited() -> InheritedSelection {
        InheritedSelection {
            agent: Some("build".to_string()),
            model: Some("gpt-5".to_string()),
        }
    }

    #[tokio::test]
    async fn create_task_ids_are_pairwise_distinct() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();

        let a = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;
        let b = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;

        assert_ne!(a.id, b.id);
        assert_ne!(a.task_session_id, b.task_session_id);

        // Archived ids stay reserved too
        registry.archive_task("s1", &a.id).await;
        let c = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;
        assert_ne!(c.id, a.id);
        assert_ne!(c.id, b.id);
    }

    #[tokio::test]
    async fn provisioning_failure_degrades_to_shared_session() {
        let registry = TaskRegistry::new();
        let backend = FailingBackend;

        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;

        assert!(created.task_session_id.is_none());
        assert!(created.provisioning_warning.is_some());
        assert_eq!(registry.tasks_for("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn archive_task_is_idempotent_and_clears_focus() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();
        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;

        registry
            .set_active_task("s1", Some(created.id.clone()))
            .await;
        registry.archive_task("s1", &created.id).await;

        assert!(registry.active_task("s1").await.is_none());
        let after_once = registry.tasks_for("s1").await;

        registry.archive_task("s1", &created.id).await;
        let after_twice = registry.tasks_for("s1").await;

        assert!(after_once[0].archived);
        assert_eq!(after_once.len(), after_twice.len());
        assert!(after_twice[0].archived);
    }

    #[tokio::test]
    async fn append_message_is_set_like() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();
        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;

        assert!(registry.append_message(&created.id, "m1").await);
        assert!(!registry.append_message(&created.id, "m1").await);

        let tasks = registry.tasks_for("s1").await;
        assert_eq!(tasks[0].message_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn append_message_resolves_child_session_to_owner() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();
        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;
        let child = created.task_session_id.clone().unwrap();

        assert!(registry.append_message(&child, "m1").await);
        let tasks = registry.tasks_for("s1").await;
        assert_eq!(tasks[0].message_ids, vec!["m1".to_string()]);
        assert_eq!(registry.owner_of(&child).await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn replace_message_id_swaps_in_place() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();
        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;
        let child = created.task_session_id.clone().unwrap();

        registry.append_message(&created.id, "tmp-1").await;
        registry.append_message(&created.id, "m2").await;
        assert!(registry.replace_message_id(&child, "tmp-1", "m1").await);

        let tasks = registry.tasks_for("s1").await;
        assert_eq!(
            tasks[0].message_ids,
            vec!["m1".to_string(), "m2".to_string()]
        );
    }

    #[tokio::test]
    async fn replace_message_id_reaches_degraded_tasks_on_the_parent_session() {
        let registry = TaskRegistry::new();
        let created = registry
            .create_task("s1", "Fix bug", &FailingBackend, &inherited())
            .await;
        assert!(created.task_session_id.is_none());

        registry.append_message(&created.id, "tmp-1").await;
        assert!(registry.replace_message_id("s1", "tmp-1", "m1").await);

        let tasks = registry.tasks_for("s1").await;
        assert_eq!(tasks[0].message_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn replace_message_id_appends_when_old_id_missing() {
        let registry = TaskRegistry::new();
        let backend = StubBackend::new();
        let created = registry
            .create_task("s1", "Fix bug", &backend, &inherited())
            .await;
        let child = created.task_session_id.clone().unwrap();

        assert!(registry.replace_message_id(&child, "never-there", "m1").await);
        let tasks = registry.tasks_for("s1").await;
        assert_eq!(tasks[0].message_ids, vec!["m1".to_string()]);
    }
}
