//! Dispatch queue queries
//!
//! A dispatch is stored once; each dispatcher that still owes delivery has
//! one `queue` row pointing at it. Removing the last row for a dispatch
//! removes the dispatch too (see the `queue_release_dispatch` trigger).
//! Every mutating operation runs in a single transaction.

use super::repo::Database;
use crate::error::Result;
use crate::types::{Dispatch, Payload};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::{HashMap, HashSet};

impl Database {
    /// Persist `dispatches` and queue each one for every id in `dispatcher_ids`.
    ///
    /// Re-storing a dispatch that is already queued for a dispatcher has no
    /// effect. After insertion each dispatcher's queue is trimmed to
    /// `max_queue_size(dispatcher_id)`, evicting its oldest entries first.
    /// Returns the number of evicted entries.
    pub fn store_dispatches(
        &self,
        dispatches: &[Dispatch],
        dispatcher_ids: &[String],
        max_queue_size: impl Fn(&str) -> usize,
    ) -> Result<usize> {
        if dispatches.is_empty() || dispatcher_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        {
            let mut insert_dispatch = tx.prepare(
                "INSERT OR IGNORE INTO dispatches (id, timestamp_ms, payload) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_entry = tx.prepare(
                "INSERT OR IGNORE INTO queue (dispatch_id, dispatcher_id) VALUES (?1, ?2)",
            )?;

            for dispatch in dispatches {
                let payload = serde_json::to_string(&dispatch.payload)?;
                insert_dispatch.execute(params![dispatch.id, dispatch.timestamp_ms(), payload])?;
                for dispatcher_id in dispatcher_ids {
                    insert_entry.execute(params![dispatch.id, dispatcher_id])?;
                }
            }
        }

        let mut evicted = 0;
        for dispatcher_id in dispatcher_ids {
            let removed = Self::trim_queue(&tx, dispatcher_id, max_queue_size(dispatcher_id))?;
            if removed > 0 {
                tracing::warn!(
                    dispatcher_id = %dispatcher_id,
                    evicted = removed,
                    "Queue bound exceeded, evicted oldest entries"
                );
            }
            evicted += removed;
        }

        tx.commit()?;
        Ok(evicted)
    }

    /// Delete the oldest entries of one dispatcher until at most `max` remain.
    fn trim_queue(conn: &Connection, dispatcher_id: &str, max: usize) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE dispatcher_id = ?1",
            params![dispatcher_id],
            |row| row.get(0),
        )?;
        let excess = count.saturating_sub(i64::try_from(max).unwrap_or(i64::MAX));
        if excess <= 0 {
            return Ok(0);
        }

        let removed = conn.execute(
            r#"
            DELETE FROM queue WHERE id IN (
                SELECT id FROM queue
                WHERE dispatcher_id = ?1
                ORDER BY id ASC
                LIMIT ?2
            )
            "#,
            params![dispatcher_id, excess],
        )?;
        Ok(removed)
    }

    /// Up to `limit` dispatches still pending for `dispatcher_id`, oldest first.
    ///
    /// Nothing is removed; entries stay until acknowledged.
    pub fn dequeue(&self, dispatcher_id: &str, limit: usize) -> Result<Vec<Dispatch>> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(
            r#"
            SELECT d.id, d.timestamp_ms, d.payload
            FROM queue q
            JOIN dispatches d ON d.id = q.dispatch_id
            WHERE q.dispatcher_id = ?1
            ORDER BY q.id ASC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![dispatcher_id, limit], Self::row_to_dispatch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, timestamp_ms, payload)| {
                let payload: Payload = serde_json::from_str(&payload)?;
                Ok(Dispatch::from_parts(id, timestamp_ms, payload))
            })
            .collect()
    }

    fn row_to_dispatch(row: &Row) -> rusqlite::Result<(String, i64, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    /// Remove the entries of `dispatch_ids` for `dispatcher_id`.
    ///
    /// Dispatches left without any entry are garbage-collected. Returns the
    /// number of entries removed.
    pub fn acknowledge(&self, dispatch_ids: &[String], dispatcher_id: &str) -> Result<usize> {
        if dispatch_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut delete = tx
                .prepare("DELETE FROM queue WHERE dispatch_id = ?1 AND dispatcher_id = ?2")?;
            for dispatch_id in dispatch_ids {
                removed += delete.execute(params![dispatch_id, dispatcher_id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Remove every pending entry for one dispatcher.
    pub fn delete_all(&self, dispatcher_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM queue WHERE dispatcher_id = ?1",
            params![dispatcher_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove a dispatcher's entries whose dispatch was created before `cutoff`.
    pub fn delete_expired(&self, dispatcher_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            r#"
            DELETE FROM queue
            WHERE dispatcher_id = ?1
              AND dispatch_id IN (SELECT id FROM dispatches WHERE timestamp_ms < ?2)
            "#,
            params![dispatcher_id, cutoff.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove entries of every dispatcher not in `dispatcher_ids`.
    pub fn retain_dispatchers(&self, dispatcher_ids: &[String]) -> Result<usize> {
        let keep: HashSet<&str> = dispatcher_ids.iter().map(String::as_str).collect();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stale: Vec<String> = tx
            .prepare("SELECT DISTINCT dispatcher_id FROM queue")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();

        let mut removed = 0;
        for dispatcher_id in &stale {
            removed += tx.execute(
                "DELETE FROM queue WHERE dispatcher_id = ?1",
                params![dispatcher_id],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Number of entries pending for one dispatcher.
    pub fn queue_size(&self, dispatcher_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE dispatcher_id = ?1",
            params![dispatcher_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Number of entries pending per dispatcher (dispatchers with none are absent).
    pub fn queue_sizes(&self) -> Result<HashMap<String, usize>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT dispatcher_id, COUNT(*) FROM queue GROUP BY dispatcher_id")?;
        let sizes = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(sizes)
    }

    /// Ids of all dispatchers that have pending entries.
    pub fn queued_dispatcher_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let ids = conn
            .prepare("SELECT DISTINCT dispatcher_id FROM queue ORDER BY dispatcher_id")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Number of stored dispatch rows.
    pub fn dispatch_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dispatches", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
