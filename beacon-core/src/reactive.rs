//! Push-based state streams
//!
//! Every piece of gating state in the pipeline (barrier states, connectivity,
//! queue sizes, registrations) is published through a [`StateSubject`] and
//! observed through [`StateStream`]s. Streams replay the latest value: a new
//! subscriber can read the current value immediately and is then woken on
//! every subsequent change. Consumers never poll.
//!
//! Both types are thin wrappers around `tokio::sync::watch`.

use std::sync::Arc;

use futures::future::{pending, select_all};
use tokio::sync::watch;

/// Writer side of a replay-latest state stream.
///
/// Publishing a value equal to the current one is a no-op, so observers only
/// wake on real transitions.
pub struct StateSubject<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for StateSubject<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + PartialEq> StateSubject<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Publish `value`. Returns `true` if it differed from the current value.
    pub fn publish(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Mutate the current value in place. `f` returns whether it changed
    /// anything; observers are only notified when it did.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> StateStream<T> {
        StateStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of a replay-latest state stream.
///
/// Dropping the stream unsubscribes it.
pub struct StateStream<T> {
    rx: watch::Receiver<T>,
}

impl<T> Clone for StateStream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> StateStream<T> {
    /// A stream that holds `value` forever and never changes.
    pub fn constant(value: T) -> Self {
        let (_tx, rx) = watch::channel(value);
        Self { rx }
    }

    /// Latest published value.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns `false` once the writer is gone and
    /// no further values can arrive.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait for the next change and return the new value.
    pub async fn next(&mut self) -> Option<T> {
        if self.changed().await {
            Some(self.rx.borrow_and_update().clone())
        } else {
            None
        }
    }

    /// Wait until the current or a future value satisfies `predicate`.
    ///
    /// Returns `None` if the writer goes away first.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.rx
            .wait_for(|value| predicate(value))
            .await
            .ok()
            .map(|value| value.clone())
    }

    /// Whether the writer has been dropped.
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

/// Wait until any still-open stream in `streams` changes.
///
/// Streams whose writer has gone are skipped; if none are left this never
/// completes, which lets callers race it against other events in a
/// `tokio::select!`.
pub async fn any_changed<T: Clone>(streams: &mut [StateStream<T>]) {
    let waits: Vec<_> = streams
        .iter_mut()
        .filter(|stream| !stream.is_closed())
        .map(|stream| Box::pin(stream.changed()))
        .collect();

    if waits.is_empty() {
        return pending().await;
    }
    select_all(waits).await;
}
