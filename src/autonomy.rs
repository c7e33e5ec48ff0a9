// Autonomy Controller
// Per-instance state machine deciding whether the system may act without
// per-step confirmation: cooldown limiter, repeat-error circuit breaker,
// idle-continuation guard, and the FIFO task queue.

use crate::config::DeckConfig;
use crate::logs::now_ms;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

static DIGIT_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static WHITESPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Kinds of action the controller may take on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomousActionKind {
    ErrorRecovery,
    IdleContinuation,
}

/// Autonomy state for one instance. Created lazily on first access and kept
/// for the life of the instance.
#[derive(Debug, Clone)]
pub struct AutonomyState {
    pub is_autonomous: bool,
    pub auto_approval: bool,
    pub is_apex: bool,
    pub max_steps: u32,
    pub current_step: u32,
    pub active_task_id: Option<String>,
    /// Mutated only via append-at-tail / remove-from-head
    task_queue: VecDeque<String>,
    pub last_action_at_ms: Option<u64>,
    pub consecutive_error_count: u32,
    pub last_error_signature: Option<String>,
    pub is_continuation_from_idle: bool,
}

impl AutonomyState {
    fn new(config: &DeckConfig) -> Self {
        Self {
            is_autonomous: false,
            auto_approval: config.auto_approval_default,
            is_apex: false,
            max_steps: config.max_steps,
            current_step: 0,
            active_task_id: None,
            task_queue: VecDeque::new(),
            last_action_at_ms: None,
            consecutive_error_count: 0,
            last_error_signature: None,
            is_continuation_from_idle: false,
        }
    }
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct AutonomySnapshot {
    pub is_autonomous: bool,
    pub auto_approval: bool,
    pub is_apex: bool,
    pub max_steps: u32,
    pub current_step: u32,
    pub active_task_id: Option<String>,
    pub task_queue: Vec<String>,
    pub last_action_elapsed_ms: Option<u64>,
    pub consecutive_error_count: u32,
    pub is_continuation_from_idle: bool,
}

type ClockFn = dyn Fn() -> u64 + Send + Sync;

/// Controller over all instances' autonomy state. State is keyed strictly by
/// instance id; instances never share mutable state.
pub struct AutonomyController {
    config: DeckConfig,
    instances: RwLock<HashMap<String, AutonomyState>>,
    clock: Arc<ClockFn>,
}

impl AutonomyController {
    pub fn new(config: DeckConfig) -> Self {
        Self::with_clock(config, Arc::new(now_ms))
    }

    /// Construct with an injectable clock so cooldown behavior is testable
    /// without sleeping.
    pub fn with_clock(config: DeckConfig, clock: Arc<ClockFn>) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Whether an autonomous action of `kind` is currently allowed.
    pub async fn can_perform_autonomous_action(
        &self,
        instance_id: &str,
        kind: AutonomousActionKind,
    ) -> bool {
        let mut instances = self.instances.write().await;
        let state = entry(&mut instances, instance_id, &self.config);

        match kind {
            AutonomousActionKind::ErrorRecovery => {
                // Circuit breaker: identical-signature failures repeated too
                // often halt automatic recovery until an operator resets it.
                if state.consecutive_error_count >= self.config.max_consecutive_errors {
                    return false;
                }
            }
            AutonomousActionKind::IdleContinuation => {
                // Re-entrancy guard against self-continuation loops
                if state.is_continuation_from_idle {
                    return false;
                }
            }
        }

        // Leaky-bucket limiter shared across both kinds
        if let Some(last) = state.last_action_at_ms {
            let now = (self.clock)();
            if now.saturating_sub(last) < self.config.cooldown_ms {
                return false;
            }
        }
        true
    }

    /// Record that an autonomous action was taken.
    pub async fn record_autonomous_action(
        &self,
        instance_id: &str,
        kind: AutonomousActionKind,
        error_text: Option<&str>,
    ) {
        let mut instances = self.instances.write().await;
        let max_errors = self.config.max_consecutive_errors;
        let sig_len = self.config.error_signature_max_len;
        let state = entry(&mut instances, instance_id, &self.config);

        match kind {
            AutonomousActionKind::ErrorRecovery => {
                let signature = normalize_error_signature(error_text.unwrap_or(""), sig_len);
                if state.last_error_signature.as_deref() == Some(signature.as_str()) {
                    state.consecutive_error_count += 1;
                    if state.consecutive_error_count == max_errors {
                        tracing::warn!(
                            instance = instance_id,
                            signature = %signature,
                            "Autonomous error recovery circuit opened after {} identical failures",
                            max_errors
                        );
                    }
                } else {
                    state.consecutive_error_count = 1;
                    state.last_error_signature = Some(signature);
                }
            }
            AutonomousActionKind::IdleContinuation => {
                state.is_continuation_from_idle = true;
            }
        }
        state.last_action_at_ms = Some((self.clock)());
    }

    /// Called once an action cycle completes so the next cycle is not treated
    /// as a continuation.
    pub async fn clear_continuation_flag(&self, instance_id: &str) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config).is_continuation_from_idle = false;
    }

    /// Operator escape hatch that closes the recovery circuit.
    pub async fn reset_error_recovery(&self, instance_id: &str) {
        let mut instances = self.instances.write().await;
        let state = entry(&mut instances, instance_id, &self.config);
        state.consecutive_error_count = 0;
        state.last_error_signature = None;
    }

    pub async fn set_autonomous(&self, instance_id: &str, enabled: bool) {
        let mut instances = self.instances.write().await;
        let state = entry(&mut instances, instance_id, &self.config);
        state.is_autonomous = enabled;
        if enabled {
            state.current_step = 0;
        }
    }

    pub async fn set_auto_approval(&self, instance_id: &str, enabled: bool) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config).auto_approval = enabled;
    }

    pub async fn set_apex(&self, instance_id: &str, enabled: bool) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config).is_apex = enabled;
    }

    pub async fn set_active_task(&self, instance_id: &str, task_id: Option<String>) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config).active_task_id = task_id;
    }

    /// Consume one step of the autonomous budget. Returns false once the
    /// budget is exhausted.
    pub async fn begin_step(&self, instance_id: &str) -> bool {
        let mut instances = self.instances.write().await;
        let state = entry(&mut instances, instance_id, &self.config);
        if state.current_step >= state.max_steps {
            return false;
        }
        state.current_step += 1;
        true
    }

    pub async fn reset_steps(&self, instance_id: &str) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config).current_step = 0;
    }

    pub async fn add_to_task_queue(&self, instance_id: &str, task_id: String) {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config)
            .task_queue
            .push_back(task_id);
    }

    pub async fn pop_from_task_queue(&self, instance_id: &str) -> Option<String> {
        let mut instances = self.instances.write().await;
        entry(&mut instances, instance_id, &self.config)
            .task_queue
            .pop_front()
    }

    pub async fn snapshot(&self, instance_id: &str) -> AutonomySnapshot {
        let mut instances = self.instances.write().await;
        let state = entry(&mut instances, instance_id, &self.config);
        let now = (self.clock)();
        AutonomySnapshot {
            is_autonomous: state.is_autonomous,
            auto_approval: state.auto_approval,
            is_apex: state.is_apex,
            max_steps: state.max_steps,
            current_step: state.current_step,
            active_task_id: state.active_task_id.clone(),
            task_queue: state.task_queue.iter().cloned().collect(),
            last_action_elapsed_ms: state.last_action_at_ms.map(|t| now.saturating_sub(t)),
            consecutive_error_count: state.consecutive_error_count,
            is_continuation_from_idle: state.is_continuation_from_idle,
        }
    }
}

fn entry<'a>(
    instances: &'a mut HashMap<String, AutonomyState>,
    instance_id: &str,
    config: &DeckConfig,
) -> &'a mut AutonomyState {
    instances
        .entry(instance_id.to_string())
        .or_insert_with(|| AutonomyState::new(config))
}

/// Normalize an error message into a repeat-detection signature: lowercase,
/// digit runs masked with a single `#`, whitespace runs collapsed to one
/// space, truncated to `max_len` characters. Two different errors that mask
/// to the same string ARE treated as repeats; loop prevention depends on it.
pub fn normalize_error_signature(text: &str, max_len: usize) -> String {
    let lowered = text.to_lowercase();
    let masked = DIGIT_RUNS.replace_all(&lowered, "#");
    let collapsed = WHITESPACE_RUNS.replace_all(&masked, " ");
    collapsed.chars().take(max_len).collect()
}
