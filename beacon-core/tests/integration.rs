//! Integration tests for the delivery pipeline
//!
//! These tests drive a full [`Tracker`] against an on-disk queue and verify
//! the barrier, connectivity and persistence behavior end to end.

use async_trait::async_trait;
use beacon_core::barrier::{Barrier, BarrierScope, BarrierState};
use beacon_core::config::BarrierSettings;
use beacon_core::connectivity::{ConnectionType, ConnectivityManager, ManualMonitor, NetworkStatus};
use beacon_core::network::{NetworkError, RequestInterceptor};
use beacon_core::reactive::{StateStream, StateSubject};
use beacon_core::{Config, Database, Dispatch, Dispatcher, Tracker};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================
// Fixtures
// ============================================

/// Records every batch and acknowledges according to `accept`.
struct RecordingDispatcher {
    id: String,
    limit: usize,
    accept: bool,
    batches: StateSubject<Vec<Vec<String>>>,
}

impl RecordingDispatcher {
    fn new(id: &str, limit: usize) -> Arc<Self> {
        Self::with_accept(id, limit, true)
    }

    fn with_accept(id: &str, limit: usize, accept: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            limit,
            accept,
            batches: StateSubject::new(Vec::new()),
        })
    }

    fn sent(&self) -> usize {
        self.batches.get().len()
    }

    async fn wait_batches(&self, count: usize) -> Vec<Vec<String>> {
        let mut batches = self.batches.subscribe();
        tokio::time::timeout(
            Duration::from_secs(3),
            batches.wait_for(|batches| batches.len() >= count),
        )
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("{} never received {} batches", self.id, count))
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn dispatch_limit(&self) -> usize {
        self.limit
    }

    async fn dispatch(&self, dispatches: &[Dispatch]) -> Vec<String> {
        let ids: Vec<String> = dispatches.iter().map(|d| d.id.clone()).collect();
        self.batches.update(|batches| {
            batches.push(ids.clone());
            true
        });
        if self.accept {
            ids
        } else {
            Vec::new()
        }
    }
}

/// Host-controlled barrier, e.g. a consent gate.
struct SwitchBarrier {
    state: StateSubject<BarrierState>,
}

impl SwitchBarrier {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            state: StateSubject::new(BarrierState::Closed),
        })
    }

    fn open(&self) {
        self.state.publish(BarrierState::Open);
    }
}

impl Barrier for SwitchBarrier {
    fn id(&self) -> &str {
        "consent"
    }

    fn state(&self, _dispatcher_id: &str) -> StateStream<BarrierState> {
        self.state.subscribe()
    }
}

fn open_database(path: &Path) -> Arc<Database> {
    let db = Database::open(path).expect("failed to open database");
    db.migrate().expect("failed to migrate database");
    Arc::new(db)
}

fn manual_connectivity(status: NetworkStatus, config: &Config) -> (Arc<ManualMonitor>, Arc<ConnectivityManager>) {
    let monitor = Arc::new(ManualMonitor::new(status));
    let manager = Arc::new(ConnectivityManager::new(monitor.clone(), &config.connectivity));
    (monitor, manager)
}

fn start(
    config: Config,
    db: &Arc<Database>,
    connectivity: &Arc<ConnectivityManager>,
    dispatchers: &[Arc<RecordingDispatcher>],
) -> Tracker {
    beacon_core::logging::init_test();
    let mut builder = Tracker::builder(config, Arc::clone(db), Arc::clone(connectivity));
    for dispatcher in dispatchers {
        builder = builder.dispatcher(dispatcher.clone());
    }
    builder.build()
}

async fn wait_queue_size(tracker: &Tracker, dispatcher_id: &str, expected: usize) {
    let mut sizes = tracker.queue().metrics().sizes();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        sizes.wait_for(|sizes| sizes.get(dispatcher_id).copied().unwrap_or(0) == expected),
    )
    .await;
    assert!(
        result.is_ok(),
        "queue size for {dispatcher_id} never reached {expected}"
    );
}

async fn idle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ============================================
// End to end
// ============================================

#[tokio::test]
async fn test_batch_of_three_delivered_in_order() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::default();
    // Monitor says offline, empirical signal still says available
    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
    let dispatcher = RecordingDispatcher::new("d", 3);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    let first = Dispatch::new("first");
    let second = Dispatch::new("second");
    let third = Dispatch::new("third");
    let expected = vec![first.id.clone(), second.id.clone(), third.id.clone()];

    tracker.track(first);
    tracker.track(second);
    wait_queue_size(&tracker, "d", 2).await;
    idle().await;
    assert_eq!(dispatcher.sent(), 0);

    tracker.track(third);
    let batches = dispatcher.wait_batches(1).await;
    assert_eq!(batches[0], expected);

    wait_queue_size(&tracker, "d", 0).await;
    tracker.shutdown().await;
    assert_eq!(db.dispatch_count().unwrap(), 0);
}

#[tokio::test]
async fn test_connectivity_failure_holds_delivery_until_recovery() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let mut config = Config::default();
    config.connectivity.backoff_base_ms = 300;
    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
    let dispatcher = RecordingDispatcher::new("d", 1);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    connectivity.on_completion(&Err(NetworkError::Connectivity("offline".into())));
    assert!(!connectivity.is_available());

    tracker.track(Dispatch::new("held"));
    wait_queue_size(&tracker, "d", 1).await;
    assert_eq!(dispatcher.sent(), 0);

    // The backoff elapses and the empirical signal reopens the gate
    dispatcher.wait_batches(1).await;
    wait_queue_size(&tracker, "d", 0).await;
}

#[tokio::test]
async fn test_monitored_connection_overrides_empirical_failure() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::default();
    let (monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
    let dispatcher = RecordingDispatcher::new("d", 1);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    connectivity.on_completion(&Err(NetworkError::Connectivity("offline".into())));
    tracker.track(Dispatch::new("held"));
    wait_queue_size(&tracker, "d", 1).await;
    idle().await;
    assert_eq!(dispatcher.sent(), 0);

    monitor.set(NetworkStatus::Connected(ConnectionType::Cellular));
    dispatcher.wait_batches(1).await;
}

// ============================================
// Barriers
// ============================================

#[tokio::test]
async fn test_scoped_barrier_blocks_only_its_dispatcher() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::default();
    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::Connected(ConnectionType::Wifi), &config);
    let gated = RecordingDispatcher::new("gated", 1);
    let free = RecordingDispatcher::new("free", 1);
    let tracker = start(config, &db, &connectivity, &[gated.clone(), free.clone()]);

    let consent = SwitchBarrier::closed();
    tracker.register_barrier(consent.clone(), vec![BarrierScope::from("gated")]);

    tracker.track(Dispatch::new("tap"));
    free.wait_batches(1).await;
    idle().await;
    assert_eq!(gated.sent(), 0);

    consent.open();
    gated.wait_batches(1).await;
}

#[tokio::test]
async fn test_wifi_only_setting_applied_at_runtime() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::default();
    let (monitor, connectivity) = manual_connectivity(NetworkStatus::Connected(ConnectionType::Cellular), &config);
    let dispatcher = RecordingDispatcher::new("d", 1);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    let settings: HashMap<String, BarrierSettings> =
        serde_json::from_value(serde_json::json!({ "connectivity": { "wifi_only": true } })).unwrap();
    tracker.apply_settings(&settings);

    tracker.track(Dispatch::new("large_upload"));
    wait_queue_size(&tracker, "d", 1).await;
    idle().await;
    assert_eq!(dispatcher.sent(), 0);

    monitor.set(NetworkStatus::Connected(ConnectionType::Wifi));
    dispatcher.wait_batches(1).await;
}

#[tokio::test]
async fn test_configured_batch_size_below_limit() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::parse(
        r#"
        [barriers.batching]
        batch_size = 2
        "#,
    )
    .unwrap();
    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::Connected(ConnectionType::Wifi), &config);
    let dispatcher = RecordingDispatcher::new("d", 10);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    tracker.track(Dispatch::new("one"));
    tracker.track(Dispatch::new("two"));
    tracker.track(Dispatch::new("three"));
    let batches = dispatcher.wait_batches(1).await;
    // Dequeued in chunks of the batch size, not the dispatch limit
    assert_eq!(batches[0].len(), 2);
    wait_queue_size(&tracker, "d", 1).await;
}

// ============================================
// Persistence
// ============================================

#[tokio::test]
async fn test_queue_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");
    let config = Config::default();

    {
        let db = open_database(&path);
        let (_monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
        let rejecting = RecordingDispatcher::with_accept("d", 2, false);
        let tracker = start(config.clone(), &db, &connectivity, &[rejecting.clone()]);

        tracker.track(Dispatch::new("one"));
        tracker.track(Dispatch::new("two"));
        rejecting.wait_batches(1).await;
        tracker.shutdown().await;
    }

    let db = open_database(&path);
    assert_eq!(db.queue_size("d").unwrap(), 2);

    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
    let accepting = RecordingDispatcher::new("d", 2);
    let tracker = start(config, &db, &connectivity, &[accepting.clone()]);

    let batches = accepting.wait_batches(1).await;
    assert_eq!(batches[0].len(), 2);
    wait_queue_size(&tracker, "d", 0).await;
}

#[tokio::test]
async fn test_queue_bound_evicts_oldest() {
    let temp = TempDir::new().unwrap();
    let db = open_database(&temp.path().join("queue.db"));
    let config = Config::parse("[queue]\nmax_queue_size = 2\n").unwrap();
    let (_monitor, connectivity) = manual_connectivity(NetworkStatus::NotConnected, &config);
    let dispatcher = RecordingDispatcher::new("d", 10);
    let tracker = start(config, &db, &connectivity, &[dispatcher.clone()]);

    let oldest = Dispatch::new("oldest");
    let oldest_id = oldest.id.clone();
    tracker.track(oldest);
    tracker.track(Dispatch::new("middle"));
    tracker.track(Dispatch::new("newest"));
    tracker.shutdown().await;

    let remaining = db.dequeue("d", 10).unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|dispatch| dispatch.id != oldest_id));
}
