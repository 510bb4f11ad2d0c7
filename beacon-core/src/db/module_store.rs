//! Generic module key/value storage
//!
//! Durable scalar state shared with other SDK modules (session and visitor
//! identifiers, for example). Each row carries an [`Expiry`]; restart-scoped
//! rows are dropped by [`Database::migrate`], session-scoped rows when the
//! session ends, and timestamped rows once their instant has passed.

use super::repo::Database;
use crate::error::Result;
use crate::types::Expiry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;

impl Database {
    pub(super) fn delete_until_restart(conn: &Connection) -> Result<usize> {
        let removed = conn.execute(
            "DELETE FROM module_storage WHERE expiry = ?1",
            params![Expiry::UntilRestart.to_column()],
        )?;
        Ok(removed)
    }

    /// Drop every session-scoped module value.
    pub fn end_module_session(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM module_storage WHERE expiry = ?1",
            params![Expiry::Session.to_column()],
        )?;
        Ok(removed)
    }

    /// Drop every timestamped module value whose expiry has passed.
    pub fn purge_expired_module_values(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM module_storage WHERE expiry >= 0 AND expiry <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

/// Key/value storage scoped to one module.
#[derive(Clone)]
pub struct ModuleStore {
    db: Arc<Database>,
    module_id: String,
}

impl ModuleStore {
    pub fn new(db: Arc<Database>, module_id: impl Into<String>) -> Self {
        Self {
            db,
            module_id: module_id.into(),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Value for `key`, unless absent or expired.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.db.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expiry FROM module_storage WHERE module_id = ?1 AND key = ?2",
                params![self.module_id, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, expiry)) if !Expiry::from_column(expiry).is_expired(Utc::now()) => {
                Ok(Some(serde_json::from_str(&value)?))
            }
            _ => Ok(None),
        }
    }

    /// Insert or replace `key`.
    pub fn set(&self, key: &str, value: &Value, expiry: Expiry) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO module_storage (module_id, key, value, expiry)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(module_id, key) DO UPDATE SET
                value = excluded.value,
                expiry = excluded.expiry
            "#,
            params![
                self.module_id,
                key,
                serde_json::to_string(value)?,
                expiry.to_column()
            ],
        )?;
        Ok(())
    }

    /// Remove `key`. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM module_storage WHERE module_id = ?1 AND key = ?2",
            params![self.module_id, key],
        )?;
        Ok(removed > 0)
    }

    /// All unexpired keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let now = Utc::now();
        let keys = conn
            .prepare("SELECT key, expiry FROM module_storage WHERE module_id = ?1 ORDER BY key")?
            .query_map(params![self.module_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|(_, expiry)| !Expiry::from_column(*expiry).is_expired(now))
            .map(|(key, _)| key)
            .collect();
        Ok(keys)
    }

    /// Remove every key of this module.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM module_storage WHERE module_id = ?1",
            params![self.module_id],
        )?;
        Ok(removed)
    }

    /// Drop timestamped values of every module that expired before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.purge_expired_module_values(now)
    }

    /// Drop session-scoped values of every module.
    pub fn on_session_end(&self) -> Result<usize> {
        self.db.end_module_session()
    }
}
