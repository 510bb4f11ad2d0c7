//! Connectivity inference
//!
//! Two independent signals feed one "assumed available" boolean:
//!
//! - the monitored status reported by the OS ([`monitor`])
//! - empirical availability inferred from request outcomes ([`empirical`])
//!
//! A monitored `Connected` always wins; otherwise the empirical signal decides.
//! One [`ConnectivityManager`] is built per SDK instance and passed to the
//! components that need it.

pub mod empirical;
pub mod monitor;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectivityConfig;
use crate::network::{NetworkError, RequestInterceptor, RequestResult, RetryPolicy};
use crate::reactive::{StateStream, StateSubject};
use crate::timing::ExponentialBackoff;

pub use empirical::EmpiricalConnectivity;
pub use monitor::{
    InterfaceType, ManualMonitor, MonitorHandle, NetworkMonitor, NetworkPath, PathMonitor,
    PathStatus, ReachabilityFlags, ReachabilityMonitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
}

/// Monitored connection classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkStatus {
    #[default]
    Unknown,
    NotConnected,
    Connected(ConnectionType),
}

impl NetworkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkStatus::Connected(_))
    }

    /// Connected over Wi-Fi or a wired link.
    pub fn is_unmetered(&self) -> bool {
        matches!(
            self,
            NetworkStatus::Connected(ConnectionType::Wifi | ConnectionType::Ethernet)
        )
    }
}

fn fuse(status: NetworkStatus, empirically_available: bool) -> bool {
    status.is_connected() || empirically_available
}

/// Fuses the monitored and empirical signals.
pub struct ConnectivityManager {
    monitor: Arc<dyn NetworkMonitor>,
    empirical: EmpiricalConnectivity,
    available: StateSubject<bool>,
    /// Waits for connectivity granted to one request
    retry_limit: usize,
    shutdown: CancellationToken,
}

impl ConnectivityManager {
    /// Must be called within a Tokio runtime.
    pub fn new(monitor: Arc<dyn NetworkMonitor>, config: &ConnectivityConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.backoff_base(), config.backoff_max());
        Self::with_empirical(monitor, EmpiricalConnectivity::new(backoff))
            .with_retry_limit(config.retry_limit)
    }

    pub fn with_empirical(monitor: Arc<dyn NetworkMonitor>, empirical: EmpiricalConnectivity) -> Self {
        let mut status = monitor.status();
        let mut empirically = empirical.available();
        let available = StateSubject::new(fuse(status.current(), empirically.current()));
        let shutdown = CancellationToken::new();

        let subject = available.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    true = status.changed() => {}
                    true = empirically.changed() => {}
                    else => break,
                }
                let fused = fuse(status.current(), empirically.current());
                if subject.publish(fused) {
                    tracing::info!(available = fused, status = ?status.current(), "Connectivity changed");
                }
            }
        });

        Self {
            monitor,
            empirical,
            available,
            retry_limit: ConnectivityConfig::default().retry_limit,
            shutdown,
        }
    }

    /// How many times one request may wait for connectivity to return.
    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Fused availability, replaying the latest value.
    pub fn available(&self) -> StateStream<bool> {
        self.available.subscribe()
    }

    /// Fused availability computed from the signals' current values.
    pub fn is_available(&self) -> bool {
        fuse(self.monitor.status().current(), self.empirical.is_available())
    }

    /// Monitored status stream.
    pub fn status(&self) -> StateStream<NetworkStatus> {
        self.monitor.status()
    }

    pub fn empirical(&self) -> &EmpiricalConnectivity {
        &self.empirical
    }

    fn refresh(&self) {
        self.available.publish(self.is_available());
    }
}

impl Drop for ConnectivityManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RequestInterceptor for ConnectivityManager {
    fn on_waiting(&self) {
        self.empirical.connection_fail();
        self.refresh();
    }

    fn on_completion(&self, result: &RequestResult) {
        match result {
            // Any response, including non-2xx, proves the network is reachable
            Ok(_) | Err(NetworkError::Status { .. }) => self.empirical.connection_success(),
            Err(NetworkError::Connectivity(_)) => self.empirical.connection_fail(),
            Err(NetworkError::Cancelled) | Err(NetworkError::Other(_)) => return,
        }
        self.refresh();
    }

    fn retry_policy(&self, error: &NetworkError, deferred: usize) -> RetryPolicy {
        if error.is_retryable() && !self.is_available() && deferred < self.retry_limit {
            RetryPolicy::When(self.available())
        } else {
            RetryPolicy::DoNotRetry
        }
    }
}
