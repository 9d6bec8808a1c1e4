//! Relational sink
//!
//! Events land in an `event` table keyed by their content hash, joined
//! to a deduplicated `entity` table through `event_entity`. The whole
//! run is one transaction: committed at flush, rolled back on any write
//! failure before the process terminates. The connection lives for the
//! process lifetime.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension as _};

use crate::dispatch::EventSink;
use crate::error::SinkError;
use crate::event::{CanonicalEvent, EVENT_TIME_FORMAT};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event (
    id       INTEGER PRIMARY KEY,
    name     TEXT NOT NULL,
    datetime TEXT NOT NULL,
    user     TEXT NOT NULL,
    hash     TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS entity (
    id    INTEGER PRIMARY KEY,
    role  TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE (role, value)
);
CREATE TABLE IF NOT EXISTS event_entity (
    event_id  INTEGER NOT NULL REFERENCES event (id),
    entity_id INTEGER NOT NULL REFERENCES entity (id)
);
";

/// Relational sink over a single SQLite database.
pub struct SqliteSink {
    conn: Connection,
    /// (role, value) -> entity id, filled as entities are resolved
    entity_cache: HashMap<(String, String), i64>,
}

impl SqliteSink {
    /// Open the database, create the schema when missing, and begin the
    /// run's transaction.
    pub fn open(db_file: &str) -> Result<Self, SinkError> {
        let conn = Connection::open(db_file)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn,
            entity_cache: HashMap::new(),
        })
    }

    fn event_exists(&self, hash: &str) -> rusqlite::Result<bool> {
        self.conn
            .query_row("SELECT 1 FROM event WHERE hash = ?1", params![hash], |_| {
                Ok(())
            })
            .optional()
            .map(|row| row.is_some())
    }

    /// Resolve an entity to its id, inserting it on first sight.
    fn entity_id(&mut self, role: &str, value: &str) -> rusqlite::Result<i64> {
        let key = (role.to_string(), value.to_string());
        if let Some(&id) = self.entity_cache.get(&key) {
            return Ok(id);
        }
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM entity WHERE role = ?1 AND value = ?2",
                params![role, value],
                |row| row.get(0),
            )
            .optional()?;
        let id = match found {
            Some(id) => id,
            None => {
                self.conn.execute(
                    "INSERT INTO entity (role, value) VALUES (?1, ?2)",
                    params![role, value],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        self.entity_cache.insert(key, id);
        Ok(id)
    }

    fn insert_event(&mut self, event: &CanonicalEvent, hash: &str) -> rusqlite::Result<()> {
        // Already persisted by an earlier run; the per-run dedup set
        // cannot see across restarts.
        if self.event_exists(hash)? {
            return Ok(());
        }

        let mut entity_ids = vec![self.entity_id("user", &event.user)?];
        for (key, value) in &event.attributes {
            entity_ids.push(self.entity_id(key, value)?);
        }

        self.conn.execute(
            "INSERT INTO event (name, datetime, user, hash) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.name,
                event.datetime.format(EVENT_TIME_FORMAT).to_string(),
                event.user,
                hash
            ],
        )?;
        let event_id = self.conn.last_insert_rowid();
        for entity_id in entity_ids {
            self.conn.execute(
                "INSERT INTO event_entity (event_id, entity_id) VALUES (?1, ?2)",
                params![event_id, entity_id],
            )?;
        }
        Ok(())
    }

    fn rollback(&self) {
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

impl EventSink for SqliteSink {
    fn write_event(&mut self, event: &CanonicalEvent, hash: &str) -> Result<(), SinkError> {
        match self.insert_event(event, hash) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.rollback();
                Err(err.into())
            }
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            self.rollback();
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(second: u32) -> CanonicalEvent {
        CanonicalEvent::new(
            "shellcmd",
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(9, 30, second)
                .unwrap(),
            "ab12cd34e",
        )
        .attr("program", "ls")
        .attr("command", "ls -la")
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_events_and_entities_persist_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        {
            let mut sink = SqliteSink::open(db.to_str().unwrap()).unwrap();
            sink.write_event(&event(1), "hash-1").unwrap();
            sink.write_event(&event(2), "hash-2").unwrap();
            sink.flush().unwrap();
        }
        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "event"), 2);
        // user + program + command entities, shared between both events.
        assert_eq!(count(&conn, "entity"), 3);
        assert_eq!(count(&conn, "event_entity"), 6);
    }

    #[test]
    fn test_event_present_by_hash_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        {
            let mut sink = SqliteSink::open(db.to_str().unwrap()).unwrap();
            sink.write_event(&event(1), "hash-1").unwrap();
            sink.flush().unwrap();
        }
        {
            // A later run re-emits the same content.
            let mut sink = SqliteSink::open(db.to_str().unwrap()).unwrap();
            sink.write_event(&event(1), "hash-1").unwrap();
            sink.flush().unwrap();
        }
        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "event"), 1);
    }

    #[test]
    fn test_unflushed_transaction_leaves_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        {
            let mut sink = SqliteSink::open(db.to_str().unwrap()).unwrap();
            sink.write_event(&event(1), "hash-1").unwrap();
            // Dropped without flush: the transaction rolls back.
        }
        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "event"), 0);
    }
}
