//! Barriers: per-dispatcher delivery gates
//!
//! A barrier reports [`BarrierState::Open`] or [`BarrierState::Closed`] for
//! each dispatcher. Barriers are registered with a list of [`BarrierScope`]s;
//! the [`BarrierCoordinator`] combines every barrier whose scopes match a
//! dispatcher into one final state.
//!
//! ## Built-in barriers
//!
//! | Id | Open when |
//! |----|-----------|
//! | `batching` | the dispatcher's queue holds at least its effective batch size |
//! | `connectivity` | the network is assumed available (and unmetered, with `wifi_only`) |

mod batching;
mod connectivity;
mod coordinator;
mod manager;

pub use batching::{BatchingBarrier, BatchingBarrierFactory, BATCHING_BARRIER_ID};
pub use connectivity::{ConnectivityBarrier, ConnectivityBarrierFactory, CONNECTIVITY_BARRIER_ID};
pub use coordinator::BarrierCoordinator;
pub use manager::{BarrierContext, BarrierFactory, BarrierManager};

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::reactive::StateStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierState {
    Open,
    Closed,
}

impl BarrierState {
    pub fn is_open(&self) -> bool {
        matches!(self, BarrierState::Open)
    }
}

impl From<bool> for BarrierState {
    fn from(open: bool) -> Self {
        if open {
            BarrierState::Open
        } else {
            BarrierState::Closed
        }
    }
}

/// A per-dispatcher gate.
pub trait Barrier: Send + Sync {
    /// Stable identifier, matching the `[barriers.<id>]` settings key.
    fn id(&self) -> &str;

    /// State stream for one dispatcher, replaying the latest value.
    fn state(&self, dispatcher_id: &str) -> StateStream<BarrierState>;

    /// State for one dispatcher computed from current inputs.
    ///
    /// May run ahead of [`Barrier::state`], whose updates are published
    /// asynchronously.
    fn current_state(&self, dispatcher_id: &str) -> BarrierState {
        self.state(dispatcher_id).current()
    }

    /// Whether a force-flush may bypass this barrier.
    fn is_flushable(&self) -> StateStream<bool> {
        StateStream::constant(true)
    }

    /// Largest batch this barrier wants delivered at once, if it cares.
    fn batch_limit(&self, _dispatcher_id: &str) -> Option<usize> {
        None
    }

    /// Apply new settings. Barriers registered ad hoc never receive this.
    fn update_configuration(&self, _configuration: &Map<String, Value>) {}
}

/// Where a barrier applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum BarrierScope {
    All,
    Dispatcher(String),
}

impl BarrierScope {
    pub fn matches(&self, dispatcher_id: &str) -> bool {
        match self {
            BarrierScope::All => true,
            BarrierScope::Dispatcher(id) => id == dispatcher_id,
        }
    }
}

impl From<String> for BarrierScope {
    fn from(scope: String) -> Self {
        if scope == "all" {
            BarrierScope::All
        } else {
            BarrierScope::Dispatcher(scope)
        }
    }
}

impl From<&str> for BarrierScope {
    fn from(scope: &str) -> Self {
        BarrierScope::from(scope.to_string())
    }
}

impl std::fmt::Display for BarrierScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierScope::All => write!(f, "all"),
            BarrierScope::Dispatcher(id) => write!(f, "{}", id),
        }
    }
}

/// A barrier together with the scopes it was registered with.
#[derive(Clone)]
pub struct ScopedBarrier {
    pub barrier: Arc<dyn Barrier>,
    pub scopes: Vec<BarrierScope>,
}

impl ScopedBarrier {
    pub fn new(barrier: Arc<dyn Barrier>, scopes: Vec<BarrierScope>) -> Self {
        Self { barrier, scopes }
    }

    pub fn applies_to(&self, dispatcher_id: &str) -> bool {
        self.scopes.iter().any(|scope| scope.matches(dispatcher_id))
    }

    pub fn is_same_barrier(&self, barrier: &Arc<dyn Barrier>) -> bool {
        same_instance(&self.barrier, barrier)
    }
}

impl PartialEq for ScopedBarrier {
    fn eq(&self, other: &Self) -> bool {
        same_instance(&self.barrier, &other.barrier) && self.scopes == other.scopes
    }
}

impl std::fmt::Debug for ScopedBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedBarrier")
            .field("barrier", &self.barrier.id())
            .field("scopes", &self.scopes)
            .finish()
    }
}

fn same_instance(a: &Arc<dyn Barrier>, b: &Arc<dyn Barrier>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Logical AND of `states`. No states means open.
pub fn combine(states: impl IntoIterator<Item = BarrierState>) -> BarrierState {
    BarrierState::from(states.into_iter().all(|state| state.is_open()))
}
