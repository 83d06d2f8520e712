// =============================================================================
// Central Application State — leadlens engine
// =============================================================================
//
// Ties the store, the runtime configuration, and the scheduler's status
// together behind one `Arc<AppState>`. The store owns all durable data;
// everything here is operational bookkeeping for the API layer.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared values.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Operational view of the scheduler, updated once per cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub last_cycle_started_at: Option<i64>,
    pub last_cycle_ms: Option<u64>,
    pub last_cycle_ok: usize,
    pub last_cycle_failed: usize,
    pub skipped_ticks: u64,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,

    pub config: RwLock<RuntimeConfig>,
    pub store: Arc<Store>,

    pub scheduler_status: RwLock<SchedulerStatus>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, store: Arc<Store>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            store,
            scheduler_status: RwLock::new(SchedulerStatus::default()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// The configured venue identifier.
    pub fn platform(&self) -> String {
        self.config.read().platform.clone()
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped; oldest entries are
    /// evicted when the limit is reached.
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        let len = errors.len();
        if len > MAX_RECENT_ERRORS {
            errors.drain(0..len - MAX_RECENT_ERRORS);
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("recent_errors", &self.recent_errors.read().len())
            .finish()
    }
}
