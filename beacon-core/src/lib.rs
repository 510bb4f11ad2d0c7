//! # beacon-core
//!
//! Core library for beacon - the persistent delivery pipeline of an event
//! tracking SDK.
//!
//! This library provides:
//! - A durable, per-dispatcher SQLite queue
//! - Barriers that gate delivery (batching, connectivity, ad hoc)
//! - Connectivity fusion of OS monitors with empirical request outcomes
//! - The delivery pipeline tying dispatchers to the queue
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A tracked dispatch flows through three stages:
//! - **Queue:** stored once per target dispatcher, bounded and expiring
//! - **Barriers:** the coordinator ANDs every barrier scoped to a dispatcher
//! - **Delivery:** while open, batches are dequeued, sent and acknowledged
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beacon_core::connectivity::{ConnectivityManager, ManualMonitor};
//! use beacon_core::{Config, Database, Dispatch, Tracker};
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let config = Config::load()?;
//!
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let connectivity = Arc::new(ConnectivityManager::new(
//!     Arc::new(ManualMonitor::default()),
//!     &config.connectivity,
//! ));
//! let tracker = Tracker::builder(config, Arc::new(db), connectivity).build();
//! tracker.track(Dispatch::new("app_launch"));
//! tracker.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use barrier::{Barrier, BarrierScope, BarrierState};
pub use config::Config;
pub use db::{Database, ModuleStore};
pub use dispatcher::{Dispatcher, DispatcherInfo};
pub use error::{Error, Result};
pub use queue::QueueManager;
pub use tracker::{Tracker, TrackerBuilder};
pub use types::*;

// Public modules
pub mod barrier;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod network;
pub mod queue;
pub mod reactive;
pub mod timing;
pub mod tracker;
pub mod types;
