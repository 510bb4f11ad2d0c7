//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! A database written by a newer schema than this build knows is dropped and
//! recreated rather than opened.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: dispatches and per-dispatcher queue rows
    r#"
    CREATE TABLE IF NOT EXISTS dispatches (
        id               TEXT PRIMARY KEY,
        timestamp_ms     INTEGER NOT NULL,
        payload          JSON NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dispatches_timestamp ON dispatches(timestamp_ms);

    -- One row per dispatcher that still owes delivery of a dispatch.
    -- AUTOINCREMENT keeps ids monotonic so ORDER BY id is insertion order.
    CREATE TABLE IF NOT EXISTS queue (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        dispatch_id      TEXT NOT NULL REFERENCES dispatches(id) ON DELETE CASCADE,
        dispatcher_id    TEXT NOT NULL,

        UNIQUE(dispatch_id, dispatcher_id)
    );

    CREATE INDEX IF NOT EXISTS idx_queue_dispatcher ON queue(dispatcher_id, id);

    -- A dispatch lives exactly as long as some dispatcher still owes it.
    CREATE TRIGGER IF NOT EXISTS queue_release_dispatch
    AFTER DELETE ON queue
    WHEN NOT EXISTS (SELECT 1 FROM queue WHERE dispatch_id = OLD.dispatch_id)
    BEGIN
        DELETE FROM dispatches WHERE id = OLD.dispatch_id;
    END;
    "#,
    // Version 2: generic module key/value storage
    r#"
    -- expiry: -1 forever, -2 session, -3 until restart, >= 0 epoch millis
    CREATE TABLE IF NOT EXISTS module_storage (
        module_id        TEXT NOT NULL,
        key              TEXT NOT NULL,
        value            JSON NOT NULL,
        expiry           INTEGER NOT NULL,

        PRIMARY KEY (module_id, key)
    );

    CREATE INDEX IF NOT EXISTS idx_module_storage_expiry ON module_storage(expiry);
    "#,
];

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// Each migration commits together with its version bump, so an interrupted
/// upgrade resumes from the last completed step.
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let mut from = get_schema_version(conn)?;

    if from > SCHEMA_VERSION {
        tracing::warn!(
            found = from,
            supported = SCHEMA_VERSION,
            "Unsupported schema downgrade, recreating database"
        );
        drop_all(conn)?;
        from = 0;
    }
    if from == SCHEMA_VERSION {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for (version, sql) in (1..).zip(MIGRATIONS.iter()).skip(from as usize) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }

    tracing::info!(from, to = SCHEMA_VERSION, "Schema migrated");
    Ok(())
}

/// Drop every user table, index and trigger and reset the version.
fn drop_all(conn: &Connection) -> crate::error::Result<()> {
    let objects: Vec<(String, String)> = conn
        .prepare(
            "SELECT type, name FROM sqlite_master
             WHERE type IN ('trigger', 'table') AND name NOT LIKE 'sqlite_%'
             ORDER BY CASE type WHEN 'trigger' THEN 0 ELSE 1 END",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    for (kind, name) in objects {
        let statement = match kind.as_str() {
            "trigger" => format!("DROP TRIGGER IF EXISTS \"{}\"", name),
            _ => format!("DROP TABLE IF EXISTS \"{}\"", name),
        };
        conn.execute_batch(&statement)?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA user_version = 0;")?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
