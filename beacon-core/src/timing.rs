//! Single-slot timers and backoff policies
//!
//! [`DelayedAction`] is the one debounce primitive used across the pipeline:
//! empirical connectivity recovery, batching re-evaluation and coordinator
//! settling all arm and cancel through it, so re-arming always replaces the
//! previous unfired action instead of stacking timers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::reactive::{StateStream, StateSubject};

/// A delayed action with at most one pending firing.
///
/// Must be armed from within a Tokio runtime. Dropping it cancels any
/// pending action.
#[derive(Default)]
pub struct DelayedAction {
    slot: Mutex<Option<AbortHandle>>,
}

impl DelayedAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, cancelling whatever was armed before.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });

        let previous = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel the pending action. Returns `true` if one was still waiting.
    pub fn cancel(&self) -> bool {
        let pending = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match pending {
            Some(handle) => {
                let was_waiting = !handle.is_finished();
                handle.abort();
                was_waiting
            }
            None => false,
        }
    }

    /// Whether an action is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for DelayedAction {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A [`StateSubject`] whose writes settle for a quiet period before they are
/// published. A zero delay publishes immediately.
pub struct SettledPublisher<T> {
    subject: StateSubject<T>,
    timer: DelayedAction,
    delay: Mutex<Duration>,
}

impl<T> SettledPublisher<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T, delay: Duration) -> Self {
        Self {
            subject: StateSubject::new(initial),
            timer: DelayedAction::new(),
            delay: Mutex::new(delay),
        }
    }

    /// Quiet period for later submissions. A pending value keeps its timer.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn submit(&self, value: T) {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if delay.is_zero() {
            self.timer.cancel();
            self.subject.publish(value);
        } else {
            let subject = self.subject.clone();
            self.timer.arm(delay, move || {
                subject.publish(value);
            });
        }
    }

    pub fn get(&self) -> T {
        self.subject.get()
    }

    pub fn subscribe(&self) -> StateStream<T> {
        self.subject.subscribe()
    }
}

/// Delay policy for consecutive failures.
///
/// Implementations must be monotonically non-decreasing in `attempt`.
pub trait Backoff: Send + Sync {
    /// Delay before recovering from the `attempt`-th consecutive failure (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_action_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DelayedAction::new();

        let counter = Arc::clone(&fired);
        timer.arm(Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_action() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DelayedAction::new();

        for _ in 0..5 {
            let counter = Arc::clone(&fired);
            timer.arm(Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DelayedAction::new();

        let counter = Arc::clone(&fired);
        timer.arm(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_publisher_coalesces() {
        let publisher = SettledPublisher::new(0, Duration::from_millis(100));
        publisher.submit(1);
        publisher.submit(2);
        assert_eq!(publisher.get(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(publisher.get(), 2);
    }

    #[tokio::test]
    async fn test_settled_publisher_zero_delay_is_immediate() {
        let publisher = SettledPublisher::new(0, Duration::ZERO);
        publisher.submit(3);
        assert_eq!(publisher.get(), 3);
    }

    #[test]
    fn test_exponential_backoff_is_monotonic_and_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(100), Duration::from_secs(10));

        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = backoff.delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
