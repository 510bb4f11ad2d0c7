//! Connectivity barrier: open while the network is assumed available.
//!
//! With `wifi_only = true` the monitored connection must also be Wi-Fi or
//! wired. The barrier is the same for every dispatcher. It only lets a
//! force-flush through while it is open, so a flush never sends offline.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::manager::{BarrierContext, BarrierFactory};
use super::{Barrier, BarrierState};
use crate::connectivity::{ConnectivityManager, NetworkStatus};
use crate::reactive::{StateStream, StateSubject};

pub const CONNECTIVITY_BARRIER_ID: &str = "connectivity";

const WIFI_ONLY_KEY: &str = "wifi_only";

fn wifi_only(configuration: &Map<String, Value>) -> bool {
    configuration
        .get(WIFI_ONLY_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn gate(available: bool, status: NetworkStatus, wifi_only: bool) -> BarrierState {
    BarrierState::from(available && (!wifi_only || status.is_unmetered()))
}

pub struct ConnectivityBarrier {
    connectivity: Arc<ConnectivityManager>,
    wifi_only: StateSubject<bool>,
    state: StateSubject<BarrierState>,
    flushable: StateSubject<bool>,
    shutdown: CancellationToken,
}

impl ConnectivityBarrier {
    /// Must be called within a Tokio runtime.
    pub fn new(connectivity: Arc<ConnectivityManager>, configuration: &Map<String, Value>) -> Self {
        let wifi_only = StateSubject::new(self::wifi_only(configuration));
        let mut available = connectivity.available();
        let mut status = connectivity.status();
        let mut policy = wifi_only.subscribe();

        let state = StateSubject::new(gate(
            connectivity.is_available(),
            status.current(),
            policy.current(),
        ));
        let flushable = StateSubject::new(state.get().is_open());
        let shutdown = CancellationToken::new();

        let subject = state.clone();
        let open = flushable.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    true = available.changed() => {}
                    true = status.changed() => {}
                    true = policy.changed() => {}
                    else => break,
                }
                let next = gate(available.current(), status.current(), policy.current());
                subject.publish(next);
                open.publish(next.is_open());
            }
        });

        Self {
            connectivity,
            wifi_only,
            state,
            flushable,
            shutdown,
        }
    }
}

impl Drop for ConnectivityBarrier {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Barrier for ConnectivityBarrier {
    fn id(&self) -> &str {
        CONNECTIVITY_BARRIER_ID
    }

    fn state(&self, _dispatcher_id: &str) -> StateStream<BarrierState> {
        self.state.subscribe()
    }

    fn current_state(&self, _dispatcher_id: &str) -> BarrierState {
        gate(
            self.connectivity.is_available(),
            self.connectivity.status().current(),
            self.wifi_only.get(),
        )
    }

    fn is_flushable(&self) -> StateStream<bool> {
        self.flushable.subscribe()
    }

    fn update_configuration(&self, configuration: &Map<String, Value>) {
        let wifi_only = wifi_only(configuration);
        if self.wifi_only.publish(wifi_only) {
            tracing::info!(wifi_only, "Connectivity barrier reconfigured");
        }
    }
}

/// Creates the [`ConnectivityBarrier`]. Applies to every dispatcher by default.
pub struct ConnectivityBarrierFactory;

impl BarrierFactory for ConnectivityBarrierFactory {
    fn id(&self) -> &str {
        CONNECTIVITY_BARRIER_ID
    }

    fn create(&self, context: &BarrierContext, configuration: &Map<String, Value>) -> Arc<dyn Barrier> {
        Arc::new(ConnectivityBarrier::new(
            Arc::clone(&context.connectivity),
            configuration,
        ))
    }
}
