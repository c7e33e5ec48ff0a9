// Taskdeck - Control layer for a multi-session AI coding workspace
// Task registry, autonomy gating, scoped caching, session working set, and
// the sync bridge that publishes view snapshots.

pub mod autonomy;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod logs;
pub mod state;
pub mod sync;
pub mod tasks;
pub mod working_set;


pub use autonomy::{AutonomousActionKind, AutonomyController};
pub use backend::{HttpBackend, InMemoryMessageStore, MessageStore, SessionBackend};
pub use cache::{CacheOwner, ScopedCache};
pub use config::DeckConfig;
pub use error::{DeckError, Result};
pub use state::DeckState;
pub use sync::{DeferredMutation, SyncBridge, ViewSnapshot};
pub use tasks::{Task, TaskRegistry, TaskStatus};
pub use working_set::WorkingSet;
