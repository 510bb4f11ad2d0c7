//! Monitored (OS-reported) connectivity observers.
//!
//! Platform bindings push raw reachability information into a monitor's
//! [`MonitorHandle`]; a single task per monitor decodes it and publishes the
//! resulting [`NetworkStatus`]. The initial status is published synchronously
//! at construction.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionType, NetworkStatus};
use crate::reactive::{StateStream, StateSubject};

/// Source of the monitored connection classification.
pub trait NetworkMonitor: Send + Sync {
    fn status(&self) -> StateStream<NetworkStatus>;
}

/// Sender half used by platform bindings to report raw updates.
pub struct MonitorHandle<U> {
    tx: mpsc::UnboundedSender<U>,
}

impl<U> Clone for MonitorHandle<U> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<U> MonitorHandle<U> {
    /// Report a raw update. Returns `false` if the monitor is gone.
    pub fn report(&self, update: U) -> bool {
        self.tx.send(update).is_ok()
    }
}

/// Decode loop shared by the monitor variants.
struct Decoder {
    status: StateSubject<NetworkStatus>,
    task: JoinHandle<()>,
}

impl Decoder {
    fn spawn<U: Send + 'static>(
        initial: &U,
        decode: fn(&U) -> NetworkStatus,
    ) -> (Self, MonitorHandle<U>) {
        let status = StateSubject::new(decode(initial));
        let (tx, mut rx) = mpsc::unbounded_channel::<U>();

        let subject = status.clone();
        let task = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let decoded = decode(&update);
                if subject.publish(decoded) {
                    tracing::debug!(status = ?decoded, "Monitored network status changed");
                }
            }
        });

        (Self { status, task }, MonitorHandle { tx })
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================
// Reachability flags
// ============================================

/// Raw reachability flags as reported by legacy platform APIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReachabilityFlags {
    pub reachable: bool,
    pub connection_required: bool,
    pub connection_on_traffic: bool,
    pub connection_on_demand: bool,
    pub intervention_required: bool,
    /// Route goes over a cellular (WWAN) interface
    pub is_wwan: bool,
}

impl ReachabilityFlags {
    pub fn decode(&self) -> NetworkStatus {
        if !self.reachable {
            return NetworkStatus::NotConnected;
        }

        let auto_connects = (self.connection_on_demand || self.connection_on_traffic)
            && !self.intervention_required;
        if self.connection_required && !auto_connects {
            return NetworkStatus::NotConnected;
        }

        if self.is_wwan {
            NetworkStatus::Connected(ConnectionType::Cellular)
        } else {
            NetworkStatus::Connected(ConnectionType::Wifi)
        }
    }
}

/// Flags-based observer.
pub struct ReachabilityMonitor {
    decoder: Decoder,
}

impl ReachabilityMonitor {
    /// Must be called within a Tokio runtime.
    pub fn new(initial: ReachabilityFlags) -> (Self, MonitorHandle<ReachabilityFlags>) {
        let (decoder, handle) = Decoder::spawn(&initial, ReachabilityFlags::decode);
        (Self { decoder }, handle)
    }
}

impl NetworkMonitor for ReachabilityMonitor {
    fn status(&self) -> StateStream<NetworkStatus> {
        self.decoder.status.subscribe()
    }
}

// ============================================
// Network paths
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    RequiresConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Wifi,
    Cellular,
    WiredEthernet,
    Loopback,
    Other,
}

/// A network path snapshot: its status and the interfaces it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPath {
    pub status: PathStatus,
    pub interfaces: Vec<InterfaceType>,
}

impl NetworkPath {
    pub fn new(status: PathStatus, interfaces: Vec<InterfaceType>) -> Self {
        Self { status, interfaces }
    }

    pub fn decode(&self) -> NetworkStatus {
        if self.status != PathStatus::Satisfied {
            return NetworkStatus::NotConnected;
        }

        let uses = |interface| self.interfaces.contains(&interface);
        if uses(InterfaceType::Wifi) {
            NetworkStatus::Connected(ConnectionType::Wifi)
        } else if uses(InterfaceType::Cellular) {
            NetworkStatus::Connected(ConnectionType::Cellular)
        } else if uses(InterfaceType::WiredEthernet) {
            NetworkStatus::Connected(ConnectionType::Ethernet)
        } else {
            NetworkStatus::Connected(ConnectionType::Wifi)
        }
    }
}

/// Path-based observer.
pub struct PathMonitor {
    decoder: Decoder,
}

impl PathMonitor {
    /// Must be called within a Tokio runtime.
    pub fn new(initial: NetworkPath) -> (Self, MonitorHandle<NetworkPath>) {
        let (decoder, handle) = Decoder::spawn(&initial, NetworkPath::decode);
        (Self { decoder }, handle)
    }
}

impl NetworkMonitor for PathMonitor {
    fn status(&self) -> StateStream<NetworkStatus> {
        self.decoder.status.subscribe()
    }
}

/// Monitor whose status is set directly, for hosts without an OS binding.
pub struct ManualMonitor {
    status: StateSubject<NetworkStatus>,
}

impl ManualMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        Self {
            status: StateSubject::new(initial),
        }
    }

    pub fn set(&self, status: NetworkStatus) {
        self.status.publish(status);
    }
}

impl Default for ManualMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unknown)
    }
}

impl NetworkMonitor for ManualMonitor {
    fn status(&self) -> StateStream<NetworkStatus> {
        self.status.subscribe()
    }
}
