//! Barrier coordinator
//!
//! For each dispatcher, one task watches the registration list, the
//! application status and every matching barrier's state, and republishes
//! their logical AND on change. Results settle through a
//! [`SettledPublisher`] so bursts of barrier transitions collapse into one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{combine, BarrierState, ScopedBarrier};
use crate::reactive::{any_changed, StateStream, StateSubject};
use crate::timing::SettledPublisher;
use crate::types::AppStatus;

type Gate = Arc<SettledPublisher<BarrierState>>;

pub struct BarrierCoordinator {
    registrations: StateStream<Vec<ScopedBarrier>>,
    app_status: StateStream<AppStatus>,
    settle: Duration,
    gates: Mutex<HashMap<String, Gate>>,
    flushes: StateSubject<u64>,
    shutdown: CancellationToken,
}

impl BarrierCoordinator {
    pub fn new(
        registrations: StateStream<Vec<ScopedBarrier>>,
        app_status: StateStream<AppStatus>,
        settle: Duration,
    ) -> Self {
        Self {
            registrations,
            app_status,
            settle,
            gates: Mutex::new(HashMap::new()),
            flushes: StateSubject::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Combined state stream for `dispatcher_id`. Must be called within a
    /// Tokio runtime; the first call for a dispatcher starts its evaluation.
    pub fn state(&self, dispatcher_id: &str) -> StateStream<BarrierState> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gate) = gates.get(dispatcher_id) {
            return gate.subscribe();
        }

        let gate: Gate = Arc::new(SettledPublisher::new(
            self.evaluate(dispatcher_id),
            self.settle,
        ));
        tokio::spawn(watch_dispatcher(
            dispatcher_id.to_string(),
            self.registrations.clone(),
            self.app_status.clone(),
            Arc::clone(&gate),
            self.shutdown.child_token(),
        ));
        let stream = gate.subscribe();
        gates.insert(dispatcher_id.to_string(), gate);
        stream
    }

    /// Combined state for `dispatcher_id` from the barriers' current inputs,
    /// without settling.
    pub fn evaluate(&self, dispatcher_id: &str) -> BarrierState {
        combine(
            matching(&self.registrations.current(), dispatcher_id)
                .map(|registration| registration.barrier.current_state(dispatcher_id)),
        )
    }

    /// How many dispatches to hand `dispatcher_id` at once: its
    /// `dispatch_limit`, capped by every matching barrier's batch limit.
    pub fn batch_limit(&self, dispatcher_id: &str, dispatch_limit: usize) -> usize {
        matching(&self.registrations.current(), dispatcher_id)
            .filter_map(|registration| registration.barrier.batch_limit(dispatcher_id))
            .fold(dispatch_limit, usize::min)
            .max(1)
    }

    /// Whether a force-flush may deliver to `dispatcher_id`: every matching
    /// barrier is currently flushable.
    pub fn can_flush(&self, dispatcher_id: &str) -> bool {
        matching(&self.registrations.current(), dispatcher_id)
            .all(|registration| registration.barrier.is_flushable().current())
    }

    /// Ask every dispatcher to flush.
    pub fn request_flush(&self) {
        self.flushes.update(|generation| {
            *generation = generation.wrapping_add(1);
            true
        });
        tracing::debug!("Flush requested");
    }

    /// Flush requests, one change per request.
    pub fn flush_requests(&self) -> StateStream<u64> {
        self.flushes.subscribe()
    }
}

impl Drop for BarrierCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn matching<'a>(
    registrations: &'a [ScopedBarrier],
    dispatcher_id: &'a str,
) -> impl Iterator<Item = &'a ScopedBarrier> + 'a {
    registrations
        .iter()
        .filter(move |registration| registration.applies_to(dispatcher_id))
}

async fn watch_dispatcher(
    dispatcher_id: String,
    mut registrations: StateStream<Vec<ScopedBarrier>>,
    mut app_status: StateStream<AppStatus>,
    gate: Gate,
    shutdown: CancellationToken,
) {
    loop {
        let mut states: Vec<StateStream<BarrierState>> = matching(&registrations.current(), &dispatcher_id)
            .map(|registration| registration.barrier.state(&dispatcher_id))
            .collect();

        let combined = combine(states.iter().map(StateStream::current));
        if combined != gate.get() {
            tracing::debug!(
                dispatcher_id = %dispatcher_id,
                state = ?combined,
                barriers = states.len(),
                "Barrier state changed"
            );
        }
        gate.submit(combined);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            true = registrations.changed() => {}
            true = app_status.changed() => {}
            _ = any_changed(&mut states) => {}
        }
    }
}
