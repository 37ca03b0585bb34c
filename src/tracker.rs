//! Set of entities whose migration is still incomplete.
//!
//! The producer adds an entity before publishing anything for it; the
//! completion handler removes it once its counter reaches zero. The first
//! time the set is emptied the tracker requests shutdown. It never fires
//! again, even if entities are added afterwards.

use crate::engine::shutdown::{ShutdownHandle, ShutdownReason};
use crate::telemetry::metrics;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Debug, Default)]
struct TrackerState {
    entities: HashSet<String>,
    /// Set by the first `add`; an empty tracker that never held anything
    /// is not considered drained.
    armed: bool,
    fired: bool,
}

#[derive(Debug, Default)]
pub struct EntityTracker {
    state: Mutex<TrackerState>,
    shutdown: Option<ShutdownHandle>,
}

impl EntityTracker {
    /// A tracker that only records drain, without requesting shutdown.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that requests [`ShutdownReason::Drained`] when emptied.
    pub fn with_shutdown(shutdown: ShutdownHandle) -> Self {
        Self {
            state: Mutex::default(),
            shutdown: Some(shutdown),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking an entity. Returns false if it was already tracked.
    pub fn add(&self, entity_id: &str) -> bool {
        let added = {
            let mut state = self.lock();
            state.armed = true;
            state.entities.insert(entity_id.to_string())
        };
        if added {
            metrics::tracked_entities().add(1, &[]);
        }
        added
    }

    /// Stop tracking an entity. Removing an absent id is a no-op.
    ///
    /// Returns true if the entity was tracked.
    pub fn remove(&self, entity_id: &str) -> bool {
        let (removed, drained) = {
            let mut state = self.lock();
            let removed = state.entities.remove(entity_id);
            (removed, removed && Self::take_drain(&mut state))
        };
        if removed {
            metrics::tracked_entities().add(-1, &[]);
        }
        if drained {
            self.fire();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.lock().entities.contains(entity_id)
    }

    /// True once something was tracked and nothing is left.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.armed && state.entities.is_empty()
    }

    /// Request shutdown if the tracker is drained and has not fired yet.
    ///
    /// Returns true if this call fired.
    pub fn notify_if_drained(&self) -> bool {
        let drained = Self::take_drain(&mut self.lock());
        if drained {
            self.fire();
        }
        drained
    }

    /// Claim the one-shot drain notification if the set is empty.
    fn take_drain(state: &mut TrackerState) -> bool {
        if state.armed && !state.fired && state.entities.is_empty() {
            state.fired = true;
            true
        } else {
            false
        }
    }

    fn fire(&self) {
        info!("all tracked entities have completed");
        if let Some(shutdown) = &self.shutdown {
            shutdown.request(ShutdownReason::Drained);
        }
    }
}
