//! Database layer for beacon
//!
//! This module provides the crash-durable storage layer using SQLite with:
//! - Schema migrations
//! - The dispatch queue (one row per pending dispatcher delivery)
//! - Generic module key/value storage with expiry

mod module_store;
mod queue;
pub mod repo;
pub mod schema;

pub use module_store::ModuleStore;
pub use repo::Database;
