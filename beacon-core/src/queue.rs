//! Queue manager
//!
//! The only component that dequeues or acknowledges. Storage errors stop
//! here: they are logged and the operation becomes a no-op, so a broken disk
//! never surfaces to code that submitted a dispatch.
//!
//! Queue sizes are published as [`QueueMetrics`], a read-only stream that
//! barriers observe without touching the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::QueueConfig;
use crate::db::Database;
use crate::reactive::{StateStream, StateSubject};
use crate::types::Dispatch;

/// Pending entries per dispatcher. Dispatchers with nothing queued are absent.
pub type QueueSizes = HashMap<String, usize>;

/// Read-only view of per-dispatcher queue sizes.
#[derive(Clone)]
pub struct QueueMetrics {
    sizes: StateStream<QueueSizes>,
}

impl QueueMetrics {
    pub fn sizes(&self) -> StateStream<QueueSizes> {
        self.sizes.clone()
    }

    pub fn queue_size(&self, dispatcher_id: &str) -> usize {
        self.sizes
            .current()
            .get(dispatcher_id)
            .copied()
            .unwrap_or(0)
    }
}

impl From<StateStream<QueueSizes>> for QueueMetrics {
    fn from(sizes: StateStream<QueueSizes>) -> Self {
        Self { sizes }
    }
}

pub struct QueueManager {
    db: Arc<Database>,
    config: QueueConfig,
    sizes: StateSubject<QueueSizes>,
}

impl QueueManager {
    pub fn new(db: Arc<Database>, config: QueueConfig) -> Self {
        let initial = db.queue_sizes().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to read queue sizes");
            QueueSizes::new()
        });
        Self {
            db,
            config,
            sizes: StateSubject::new(initial),
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            sizes: self.sizes.subscribe(),
        }
    }

    pub fn queue_size(&self, dispatcher_id: &str) -> usize {
        self.sizes.get().get(dispatcher_id).copied().unwrap_or(0)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist `dispatches` and queue them for each of `dispatcher_ids`.
    pub fn store_dispatches(&self, dispatches: &[Dispatch], dispatcher_ids: &[String]) {
        let result = self.db.store_dispatches(dispatches, dispatcher_ids, |id| {
            self.config.max_queue_size_for(id)
        });
        match result {
            Ok(evicted) => {
                tracing::debug!(
                    count = dispatches.len(),
                    dispatchers = dispatcher_ids.len(),
                    evicted,
                    "Stored dispatches"
                );
            }
            Err(e) => {
                tracing::error!(
                    count = dispatches.len(),
                    error = %e,
                    "Failed to store dispatches"
                );
            }
        }
        self.refresh_sizes();
    }

    /// Up to `limit` pending dispatches for `dispatcher_id`, oldest first.
    pub fn get_queued_dispatches(&self, dispatcher_id: &str, limit: usize) -> Vec<Dispatch> {
        self.db.dequeue(dispatcher_id, limit).unwrap_or_else(|e| {
            tracing::error!(dispatcher_id, error = %e, "Failed to dequeue dispatches");
            Vec::new()
        })
    }

    /// Record delivery of `dispatch_ids` to `dispatcher_id`.
    pub fn acknowledge(&self, dispatch_ids: &[String], dispatcher_id: &str) -> usize {
        let removed = self
            .db
            .acknowledge(dispatch_ids, dispatcher_id)
            .unwrap_or_else(|e| {
                tracing::error!(dispatcher_id, error = %e, "Failed to acknowledge dispatches");
                0
            });
        self.refresh_sizes();
        removed
    }

    /// Drop everything pending for `dispatcher_id`.
    pub fn delete_all_dispatches(&self, dispatcher_id: &str) -> usize {
        let removed = self.db.delete_all(dispatcher_id).unwrap_or_else(|e| {
            tracing::error!(dispatcher_id, error = %e, "Failed to delete dispatches");
            0
        });
        if removed > 0 {
            tracing::info!(dispatcher_id, removed, "Deleted all pending dispatches");
        }
        self.refresh_sizes();
        removed
    }

    /// Evict entries older than each dispatcher's configured expiration.
    pub fn delete_expired(&self, dispatcher_ids: &[String]) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for dispatcher_id in dispatcher_ids {
            let cutoff = self.config.expiration_for(dispatcher_id).before(now);
            match self.db.delete_expired(dispatcher_id, cutoff) {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(dispatcher_id = %dispatcher_id, removed = count, "Evicted expired dispatches");
                    removed += count;
                }
                Err(e) => {
                    tracing::error!(dispatcher_id = %dispatcher_id, error = %e, "Failed to evict expired dispatches");
                }
            }
        }
        self.refresh_sizes();
        removed
    }

    /// Drop entries of dispatchers not in `dispatcher_ids`.
    pub fn retain_dispatchers(&self, dispatcher_ids: &[String]) -> usize {
        let removed = self
            .db
            .retain_dispatchers(dispatcher_ids)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to drop unregistered dispatchers");
                0
            });
        if removed > 0 {
            tracing::info!(removed, "Dropped entries of unregistered dispatchers");
        }
        self.refresh_sizes();
        removed
    }

    fn refresh_sizes(&self) {
        match self.db.queue_sizes() {
            Ok(sizes) => {
                self.sizes.publish(sizes);
            }
            Err(e) => tracing::error!(error = %e, "Failed to read queue sizes"),
        }
    }
}
