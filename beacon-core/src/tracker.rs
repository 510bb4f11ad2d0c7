//! Delivery pipeline
//!
//! A [`Tracker`] is one SDK instance. It owns the queue manager, the barrier
//! registry and coordinator, and one delivery task per dispatcher:
//!
//! ```text
//! track() ──► processor task ──► QueueManager::store_dispatches
//!                                        │ queue sizes
//!                                        ▼
//!                         barriers ──► BarrierCoordinator ──► delivery task (one per dispatcher)
//!                                                              dequeue → dispatch → acknowledge
//! ```
//!
//! `track()` never blocks: dispatches go through an unbounded channel and are
//! stored by the processor task. Each delivery task runs at most one send at
//! a time, which keeps per-dispatcher ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::barrier::{
    Barrier, BarrierContext, BarrierCoordinator, BarrierFactory, BarrierManager, BarrierScope,
    BarrierState, BatchingBarrierFactory, ConnectivityBarrierFactory,
};
use crate::config::{BarrierSettings, Config};
use crate::connectivity::ConnectivityManager;
use crate::db::Database;
use crate::dispatcher::{Dispatcher, DispatcherInfo};
use crate::error::{Error, Result};
use crate::queue::{QueueManager, QueueSizes};
use crate::reactive::{StateStream, StateSubject};
use crate::types::{AppStatus, Dispatch};

enum Command {
    Track {
        dispatch: Dispatch,
        dispatcher_ids: Vec<String>,
    },
}

/// Builder for a [`Tracker`].
pub struct TrackerBuilder {
    config: Config,
    db: Arc<Database>,
    connectivity: Arc<ConnectivityManager>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    factories: Vec<Arc<dyn BarrierFactory>>,
}

impl TrackerBuilder {
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Add a settings-driven barrier kind next to `batching` and `connectivity`.
    pub fn barrier_factory(mut self, factory: Arc<dyn BarrierFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Start the instance. Must be called within a Tokio runtime.
    ///
    /// Runs the startup checkpoint first: entries older than their
    /// dispatcher's expiration are evicted, and entries of dispatchers that
    /// are not registered any more are dropped.
    ///
    /// A dispatcher id registered more than once keeps its first dispatcher.
    pub fn build(self) -> Tracker {
        let queue = Arc::new(QueueManager::new(Arc::clone(&self.db), self.config.queue.clone()));

        let mut registered: Vec<Arc<dyn Dispatcher>> = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in self.dispatchers {
            if registered.iter().any(|d| d.id() == dispatcher.id()) {
                tracing::warn!(dispatcher_id = dispatcher.id(), "Dispatcher already registered");
                continue;
            }
            registered.push(dispatcher);
        }

        let ids: Vec<String> = registered.iter().map(|d| d.id().to_string()).collect();
        queue.retain_dispatchers(&ids);
        queue.delete_expired(&ids);

        let dispatchers = StateSubject::new(
            registered
                .iter()
                .map(|d| DispatcherInfo::of(d.as_ref()))
                .collect::<Vec<_>>(),
        );

        let barriers = Arc::new(BarrierManager::new(
            BarrierContext {
                connectivity: Arc::clone(&self.connectivity),
                queue_metrics: queue.metrics(),
                dispatchers: dispatchers.subscribe(),
            },
            self.factories,
        ));
        barriers.apply_settings(&self.config.barriers);

        let app_status = StateSubject::new(AppStatus::Initialized);
        let coordinator = Arc::new(BarrierCoordinator::new(
            barriers.registrations(),
            app_status.subscribe(),
            self.config.coordinator.settle(),
        ));

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = tokio::spawn(process_commands(rx, Arc::clone(&queue), shutdown.clone()));

        let tracker = Tracker {
            commands: tx,
            db: self.db,
            queue,
            connectivity: self.connectivity,
            barriers,
            coordinator,
            app_status,
            dispatchers,
            shutdown,
            tasks: Mutex::new(vec![processor]),
        };
        for dispatcher in registered {
            tracker.start_delivery(dispatcher);
        }

        tracing::info!(dispatchers = ?ids, "Tracker started");
        tracker
    }
}

/// One SDK instance.
pub struct Tracker {
    commands: mpsc::UnboundedSender<Command>,
    db: Arc<Database>,
    queue: Arc<QueueManager>,
    connectivity: Arc<ConnectivityManager>,
    barriers: Arc<BarrierManager>,
    coordinator: Arc<BarrierCoordinator>,
    app_status: StateSubject<AppStatus>,
    dispatchers: StateSubject<Vec<DispatcherInfo>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Tracker {
    /// Start building an instance. The `batching` and `connectivity` barrier
    /// factories are always included.
    pub fn builder(
        config: Config,
        db: Arc<Database>,
        connectivity: Arc<ConnectivityManager>,
    ) -> TrackerBuilder {
        TrackerBuilder {
            config,
            db,
            connectivity,
            dispatchers: Vec::new(),
            factories: vec![
                Arc::new(BatchingBarrierFactory) as Arc<dyn BarrierFactory>,
                Arc::new(ConnectivityBarrierFactory),
            ],
        }
    }

    /// Queue `dispatch` for every registered dispatcher.
    pub fn track(&self, dispatch: Dispatch) {
        let dispatcher_ids = self.dispatcher_ids();
        self.send(Command::Track {
            dispatch,
            dispatcher_ids,
        });
    }

    /// Queue `dispatch` for the given dispatchers only.
    pub fn track_for(&self, dispatch: Dispatch, dispatcher_ids: Vec<String>) {
        self.send(Command::Track {
            dispatch,
            dispatcher_ids,
        });
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Tracker is shut down, dispatch dropped");
        }
    }

    /// Deliver pending dispatches to every dispatcher whose barriers are all
    /// flushable, regardless of their state.
    pub fn flush(&self) {
        self.coordinator.request_flush();
    }

    /// Report a foreground/background transition. Entering the background
    /// flushes.
    pub fn set_app_status(&self, status: AppStatus) {
        if self.app_status.publish(status) {
            tracing::debug!(?status, "App status changed");
            if status == AppStatus::Background {
                self.flush();
            }
        }
    }

    /// Reconfigure settings-driven barriers.
    pub fn apply_settings(&self, settings: &HashMap<String, BarrierSettings>) {
        self.barriers.apply_settings(settings);
    }

    pub fn register_barrier(&self, barrier: Arc<dyn Barrier>, scopes: Vec<BarrierScope>) {
        self.barriers.register(barrier, scopes);
    }

    pub fn unregister_barrier(&self, barrier: &Arc<dyn Barrier>) -> bool {
        self.barriers.unregister(barrier)
    }

    /// Register another dispatcher and start delivering to it.
    pub fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let info = DispatcherInfo::of(dispatcher.as_ref());
        let added = self.dispatchers.update(|infos| {
            if infos.iter().any(|existing| existing.id == info.id) {
                false
            } else {
                infos.push(info.clone());
                true
            }
        });
        if added {
            tracing::info!(dispatcher_id = %info.id, "Dispatcher added");
            self.start_delivery(dispatcher);
        } else {
            tracing::warn!(dispatcher_id = %info.id, "Dispatcher already registered");
        }
    }

    /// Drop everything pending for one dispatcher (e.g. consent denied).
    pub fn delete_all_dispatches(&self, dispatcher_id: &str) -> Result<usize> {
        if !self.dispatchers.get().iter().any(|info| info.id == dispatcher_id) {
            return Err(Error::UnknownDispatcher(dispatcher_id.to_string()));
        }
        Ok(self.queue.delete_all_dispatches(dispatcher_id))
    }

    /// Settings-driven barrier by id, e.g. `batching`.
    pub fn barrier(&self, id: &str) -> Result<Arc<dyn Barrier>> {
        self.barriers.barrier(id)
    }

    /// Session-end checkpoint: evict expired entries and session-scoped
    /// module values.
    pub fn end_session(&self) {
        self.queue.delete_expired(&self.dispatcher_ids());
        if let Err(e) = self.db.end_module_session() {
            tracing::error!(error = %e, "Failed to drop session-scoped module values");
        }
    }

    pub fn dispatcher_ids(&self) -> Vec<String> {
        self.dispatchers
            .get()
            .into_iter()
            .map(|info| info.id)
            .collect()
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityManager> {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &Arc<BarrierCoordinator> {
        &self.coordinator
    }

    /// Combined barrier state stream for one dispatcher.
    pub fn barrier_state(&self, dispatcher_id: &str) -> StateStream<BarrierState> {
        self.coordinator.state(dispatcher_id)
    }

    /// Stop all tasks. In-flight sends are dropped without acknowledging
    /// anything; dispatches already handed to `track` are stored first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Tracker task ended abnormally");
            }
        }
        tracing::info!("Tracker stopped");
    }

    fn start_delivery(&self, dispatcher: Arc<dyn Dispatcher>) {
        // Subscribed here, not in the task: a flush or track issued before
        // the task is first polled must still wake it.
        let gate = self.coordinator.state(dispatcher.id());
        let last_size = self.queue.queue_size(dispatcher.id());
        let delivery = Delivery {
            gate,
            flushes: self.coordinator.flush_requests(),
            sizes: self.queue.metrics().sizes(),
            last_size,
            dispatcher,
            queue: Arc::clone(&self.queue),
            coordinator: Arc::clone(&self.coordinator),
            shutdown: self.shutdown.child_token(),
        };
        let task = tokio::spawn(delivery.run());
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn process_commands(
    mut commands: mpsc::UnboundedReceiver<Command>,
    queue: Arc<QueueManager>,
    shutdown: CancellationToken,
) {
    let handle = |command: Command| match command {
        Command::Track {
            dispatch,
            dispatcher_ids,
        } => {
            if dispatcher_ids.is_empty() {
                tracing::debug!(dispatch_id = %dispatch.id, "No dispatcher to queue for");
                return;
            }
            queue.store_dispatches(&[dispatch], &dispatcher_ids);
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => handle(command),
                None => return,
            },
        }
    }

    // Store whatever was tracked before shutdown
    commands.close();
    while let Ok(command) = commands.try_recv() {
        handle(command);
    }
}

/// The send was abandoned because the tracker is shutting down.
struct Cancelled;

/// Delivery loop for one dispatcher.
struct Delivery {
    dispatcher: Arc<dyn Dispatcher>,
    gate: StateStream<BarrierState>,
    flushes: StateStream<u64>,
    sizes: StateStream<QueueSizes>,
    /// Queue size seen when delivery last looked.
    last_size: usize,
    queue: Arc<QueueManager>,
    coordinator: Arc<BarrierCoordinator>,
    shutdown: CancellationToken,
}

impl Delivery {
    async fn run(mut self) {
        let id = self.dispatcher.id().to_string();
        let mut forced = false;

        loop {
            if forced || self.is_open() {
                if self.drain(forced).await.is_err() {
                    break;
                }
                self.last_size = self.queue.queue_size(&id);
            }
            forced = false;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                true = self.gate.changed() => {}
                true = self.flushes.changed() => {
                    forced = self.coordinator.can_flush(&id);
                    if !forced {
                        tracing::debug!(dispatcher_id = %id, "Flush blocked by a non-flushable barrier");
                    }
                }
                true = self.sizes.changed() => {
                    let size = self.sizes.current().get(&id).copied().unwrap_or(0);
                    let grew = size > self.last_size;
                    self.last_size = size;
                    if !grew {
                        continue;
                    }
                }
            }
        }

        tracing::debug!(dispatcher_id = %id, "Delivery stopped");
    }

    /// The settled gate decides when to look; the live barrier state decides
    /// whether to send. A gate still open from before the last drain must not
    /// push out a batch the barriers no longer allow. Both must be open.
    fn is_open(&self) -> bool {
        self.gate.current().is_open() && self.coordinator.evaluate(self.dispatcher.id()).is_open()
    }

    /// Send batches until the queue is empty, the gate closes or a send makes
    /// no progress. A forced drain ignores the gate.
    async fn drain(&self, forced: bool) -> std::result::Result<(), Cancelled> {
        let id = self.dispatcher.id();

        loop {
            let limit = self
                .coordinator
                .batch_limit(id, self.dispatcher.dispatch_limit());
            let batch = self.queue.get_queued_dispatches(id, limit);
            if batch.is_empty() {
                return Ok(());
            }

            let delivered = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(dispatcher_id = id, count = batch.len(), "Send cancelled");
                    return Err(Cancelled);
                }
                delivered = self.dispatcher.dispatch(&batch) => delivered,
            };

            let delivered: Vec<String> = delivered
                .into_iter()
                .filter(|delivered| batch.iter().any(|dispatch| &dispatch.id == delivered))
                .collect();
            let acknowledged = if delivered.is_empty() {
                0
            } else {
                self.queue.acknowledge(&delivered, id)
            };

            tracing::debug!(
                dispatcher_id = id,
                sent = batch.len(),
                acknowledged,
                forced,
                "Delivery attempt finished"
            );

            if acknowledged == 0 {
                return Ok(());
            }
            if !forced && !self.coordinator.evaluate(id).is_open() {
                return Ok(());
            }
        }
    }
}
