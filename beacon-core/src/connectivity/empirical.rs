//! Availability inferred from the outcome of real requests.
//!
//! A failure marks the network unavailable at once and arms a recovery timer
//! whose length grows with each consecutive failure. If the timer fires before
//! another outcome arrives, the network is optimistically assumed back.

use std::sync::{Arc, Mutex};

use crate::reactive::{StateStream, StateSubject};
use crate::timing::{Backoff, DelayedAction, ExponentialBackoff};

#[derive(Debug, Default)]
struct FailureState {
    failed_consecutive_timeouts: u32,
    /// Bumped by every outcome; a recovery timer only acts on its own generation.
    generation: u64,
}

/// Empirical connectivity observer.
pub struct EmpiricalConnectivity {
    available: StateSubject<bool>,
    state: Arc<Mutex<FailureState>>,
    recovery: DelayedAction,
    backoff: Box<dyn Backoff>,
}

impl Default for EmpiricalConnectivity {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl EmpiricalConnectivity {
    pub fn new(backoff: impl Backoff + 'static) -> Self {
        Self {
            available: StateSubject::new(true),
            state: Arc::new(Mutex::new(FailureState::default())),
            recovery: DelayedAction::new(),
            backoff: Box::new(backoff),
        }
    }

    pub fn available(&self) -> StateStream<bool> {
        self.available.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.available.get()
    }

    /// Consecutive recovery timeouts since the last success.
    pub fn failed_consecutive_timeouts(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failed_consecutive_timeouts
    }

    /// A request got through.
    pub fn connection_success(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.generation += 1;
            state.failed_consecutive_timeouts = 0;
            self.available.publish(true);
        }
        self.recovery.cancel();
    }

    /// A request could not reach the network. Must be called within a Tokio
    /// runtime.
    pub fn connection_fail(&self) {
        let (attempt, generation) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.generation += 1;
            if self.available.publish(false) {
                tracing::debug!(
                    failed_consecutive_timeouts = state.failed_consecutive_timeouts,
                    "Network assumed unavailable"
                );
            }
            (state.failed_consecutive_timeouts + 1, state.generation)
        };

        let delay = self.backoff.delay(attempt);
        let state = Arc::clone(&self.state);
        let available = self.available.clone();
        self.recovery.arm(delay, move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                return;
            }
            state.failed_consecutive_timeouts += 1;
            available.publish(true);
            tracing::debug!(
                failed_consecutive_timeouts = state.failed_consecutive_timeouts,
                "Network assumed available again"
            );
        });
    }
}
