//! Process-wide network activity tracking

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;
use uuid::Uuid;

/// Identity of one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(Uuid);

impl EngineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EngineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Told when engine runs start and finish
///
/// Each started run is finished exactly once, whichever way it ends. Runs
/// whose action disables the network activity indicator are not reported.
pub trait RunListener: Send + Sync {
    fn run_started(&self, engine: EngineId);
    fn run_finished(&self, engine: EngineId);
}

/// Reference-counted "network activity" indicator shared by a client's engines
#[derive(Debug, Default)]
pub struct ActivityPool {
    in_progress: AtomicUsize,
}

impl ActivityPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs currently in flight
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.in_progress() > 0
    }
}

impl RunListener for ActivityPool {
    fn run_started(&self, engine: EngineId) {
        let now = self.in_progress.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(engine = %engine, in_progress = now, "run started");
    }

    fn run_finished(&self, engine: EngineId) {
        // Unbalanced finishes must not wrap the counter
        let previous = self
            .in_progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        trace!(engine = %engine, in_progress = previous.saturating_sub(1), "run finished");
    }
}
