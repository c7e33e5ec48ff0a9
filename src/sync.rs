// Sync Bridge
// Fixed-interval polling loop that copies authoritative state (task list,
// message ids, usage, streaming flag) into a view snapshot, and the
// single-consumer queue that applies user-originated mutations outside the
// caller's stack frame. Each tick is an idempotent recomputation from current
// truth: a missed tick delays visibility by at most one interval, nothing
// more.

use crate::autonomy::AutonomyController;
use crate::backend::{MessageRole, MessageStatus, MessageStore, UsageTotals};
use crate::config::DeckConfig;
use crate::error::{DeckError, Result};
use crate::logs::now_ms;
use crate::state::{BusyFlags, Focus};
use crate::tasks::{Task, TaskRegistry};
use crate::working_set::WorkingSet;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Fresh copy of authoritative state for the presentation layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewSnapshot {
    pub tasks: Vec<Task>,
    pub active_task_id: Option<String>,
    pub focused_session_id: Option<String>,
    pub message_ids: Vec<String>,
    pub usage: UsageTotals,
    pub is_streaming: bool,
    pub retained_sessions: Vec<String>,
    pub updated_at_ms: u64,
}

/// Mutations originating from user interaction. The caller updates its local
/// view immediately; the authoritative write happens on the bridge task,
/// never inside the input handler's call stack.
#[derive(Debug, Clone)]
pub enum DeferredMutation {
    SelectTask {
        parent_session_id: String,
        task_id: Option<String>,
    },
    ArchiveTask {
        parent_session_id: String,
        task_id: String,
    },
    QueueTask {
        task_id: String,
    },
    ForceResetBusy {
        session_id: String,
    },
}

/// Everything one bridge instance reads from and writes to.
#[derive(Clone)]
pub struct BridgeDeps {
    pub instance_id: String,
    pub registry: Arc<TaskRegistry>,
    pub autonomy: Arc<AutonomyController>,
    pub working_set: Arc<WorkingSet>,
    pub store: Arc<dyn MessageStore>,
    pub focus: Arc<Focus>,
    pub busy: Arc<BusyFlags>,
}

struct BridgeState {
    running: bool,
    cancel: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
}

pub struct SyncBridge {
    interval_ms: u64,
    state: Mutex<BridgeState>,
    snapshot: Arc<std::sync::RwLock<ViewSnapshot>>,
    mutation_tx: mpsc::UnboundedSender<DeferredMutation>,
    mutation_rx: Mutex<Option<mpsc::UnboundedReceiver<DeferredMutation>>>,
}

impl SyncBridge {
    pub fn new(config: &DeckConfig) -> Self {
        let (mutation_tx, mutation_rx) = mpsc::unbounded_channel();
        Self {
            interval_ms: config.sync_interval_ms,
            state: Mutex::new(BridgeState {
                running: false,
                cancel: None,
                task: None,
            }),
            snapshot: Arc::new(std::sync::RwLock::new(ViewSnapshot::default())),
            mutation_tx,
            mutation_rx: Mutex::new(Some(mutation_rx)),
        }
    }

    /// Enqueue a mutation for the bridge task to apply on its next tick.
    pub fn defer(&self, mutation: DeferredMutation) {
        // Send only fails after stop(), when deferred writes no longer matter
        let _ = self.mutation_tx.send(mutation);
    }

    /// Latest published view snapshot.
    pub fn snapshot(&self) -> ViewSnapshot {
        self.snapshot.read().unwrap().clone()
    }

    pub async fn start(&self, deps: BridgeDeps) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }

        // The mutation receiver is consumed by the first start; a stopped
        // bridge cannot run again, and pretending otherwise would hand the
        // caller a frozen snapshot.
        let Some(mut rx) = self.mutation_rx.lock().await.take() else {
            return Err(DeckError::InvalidOperation(
                "sync bridge cannot be restarted after stop".to_string(),
            ));
        };
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let snapshot_slot = self.snapshot.clone();
        let interval_ms = self.interval_ms;

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        drain_mutations(&deps, &mut rx).await;
                        let snapshot = compute_snapshot(&deps).await;
                        *snapshot_slot.write().unwrap() = snapshot;
                        deps.working_set.run_pending_evictions().await;
                    }
                    _ = loop_cancel.cancelled() => {
                        break;
                    }
                }
            }
            tracing::info!(instance = %deps.instance_id, "Sync bridge stopped");
        });

        state.running = true;
        state.cancel = Some(cancel);
        state.task = Some(task);
        Ok(())
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        state.running = false;
    }
}

async fn drain_mutations(
    deps: &BridgeDeps,
    rx: &mut mpsc::UnboundedReceiver<DeferredMutation>,
) {
    while let Ok(mutation) = rx.try_recv() {
        match mutation {
            DeferredMutation::SelectTask {
                parent_session_id,
                task_id,
            } => {
                deps.registry
                    .set_active_task(&parent_session_id, task_id.clone())
                    .await;
                deps.autonomy
                    .set_active_task(&deps.instance_id, task_id)
                    .await;
            }
            DeferredMutation::ArchiveTask {
                parent_session_id,
                task_id,
            } => {
                deps.registry
                    .archive_task(&parent_session_id, &task_id)
                    .await;
            }
            DeferredMutation::QueueTask { task_id } => {
                deps.autonomy
                    .add_to_task_queue(&deps.instance_id, task_id)
                    .await;
            }
            DeferredMutation::ForceResetBusy { session_id } => {
                deps.busy.clear(&session_id);
            }
        }
    }
}

async fn compute_snapshot(deps: &BridgeDeps) -> ViewSnapshot {
    let parent = deps.focus.parent_session();
    let Some(parent) = parent else {
        return ViewSnapshot {
            updated_at_ms: now_ms(),
            ..ViewSnapshot::default()
        };
    };

    let mut tasks = deps.registry.tasks_for(&parent).await;
    tasks.retain(|t| !t.archived);
    let active_task_id = deps.registry.active_task(&parent).await;

    // Focused session: the active task's dedicated session, else the parent
    let focused_session = active_task_id
        .as_ref()
        .and_then(|id| {
            tasks
                .iter()
                .find(|t| &t.id == id)
                .and_then(|t| t.task_session_id.clone())
        })
        .unwrap_or_else(|| parent.clone());

    deps.working_set
        .update(Some(&parent), Some(&focused_session))
        .await;

    let message_ids = deps.store.session_message_ids(&focused_session);
    let usage = deps.store.session_usage(&focused_session);
    let is_streaming = derive_streaming_flag(deps, &focused_session, &message_ids);
    let retained_sessions = deps.working_set.retained().await;

    ViewSnapshot {
        tasks,
        active_task_id,
        focused_session_id: Some(focused_session),
        message_ids,
        usage,
        is_streaming,
        retained_sessions,
        updated_at_ms: now_ms(),
    }
}

/// True while a send is in flight, or the most recent message is an assistant
/// message still streaming in.
fn derive_streaming_flag(deps: &BridgeDeps, session_id: &str, message_ids: &[String]) -> bool {
    if deps.busy.is_busy(session_id) {
        return true;
    }
    let Some(last_id) = message_ids.last() else {
        return false;
    };
    deps.store
        .get_message(last_id)
        .map(|meta| {
            meta.role == MessageRole::Assistant
                && matches!(meta.status, MessageStatus::Streaming | MessageStatus::Sending)
        })
        .unwrap_or(false)
}
