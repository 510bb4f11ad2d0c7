//! Dispatchers: sinks that deliver queued dispatches.

mod collect;

pub use collect::{CollectDispatcher, COLLECT_DISPATCHER_ID};

use async_trait::async_trait;

use crate::types::Dispatch;

/// A delivery sink.
///
/// The pipeline never runs two `dispatch` calls for the same dispatcher at
/// once. Dropping the returned future cancels the send; nothing is
/// acknowledged in that case.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Stable identifier, used as the queue key.
    fn id(&self) -> &str;

    /// Maximum number of dispatches handed to one `dispatch` call.
    fn dispatch_limit(&self) -> usize;

    /// Send `dispatches` and return the ids actually delivered.
    ///
    /// Partial success is legal; ids not returned stay queued.
    async fn dispatch(&self, dispatches: &[Dispatch]) -> Vec<String>;
}

/// What barriers need to know about a registered dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherInfo {
    pub id: String,
    pub dispatch_limit: usize,
}

impl DispatcherInfo {
    pub fn new(id: impl Into<String>, dispatch_limit: usize) -> Self {
        Self {
            id: id.into(),
            dispatch_limit,
        }
    }

    pub fn of(dispatcher: &dyn Dispatcher) -> Self {
        Self::new(dispatcher.id(), dispatcher.dispatch_limit())
    }
}
