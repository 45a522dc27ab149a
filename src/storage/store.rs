use crate::common::StorageError;
use crate::storage::models::{AccessEvent, EventFilter, EventSource, Outcome, User};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type StoreResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub reader_connections: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(2000),
            reader_connections: 2,
        }
    }
}

/// Durable users and access log.
///
/// Every write goes through the single writer connection inside a transaction.
/// Reads use a separate pool of read-only WAL connections, so they see the last
/// committed snapshot and never wait on an in-progress append. An in-memory
/// store has no reader pool and reads through the writer.
pub struct PersistentStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl PersistentStore {
    pub fn open(path: &Path, options: &StoreOptions) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        writer.busy_timeout(options.busy_timeout)?;
        setup_database(&writer)?;

        let mut readers = Vec::with_capacity(options.reader_connections);
        for _ in 0..options.reader_connections {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.busy_timeout(options.busy_timeout)?;
            readers.push(Mutex::new(reader));
        }

        tracing::info!(
            "Opened store at {} ({} reader connections)",
            path.display(),
            readers.len()
        );

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let writer = Connection::open_in_memory()?;
        setup_database(&writer)?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer();
        }
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a user, or update name and image if the label is already enrolled.
    pub fn enroll_or_update_user(
        &self,
        label: i64,
        name: &str,
        image_path: &Path,
    ) -> StoreResult<User> {
        let now = format_timestamp(&Utc::now());
        let image = image_path.to_string_lossy().into_owned();

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (label, name, image_path, enrolled_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(label) DO UPDATE SET
                name = excluded.name,
                image_path = excluded.image_path,
                updated_at = excluded.updated_at",
            params![label, name, image, now],
        )?;
        let user = tx
            .query_row(
                "SELECT label, name, image_path, enrolled_at, updated_at
                 FROM users WHERE label = ?1",
                params![label],
                row_to_user,
            )?
            .map_err(StorageError::Corrupt)?;
        tx.commit()?;

        tracing::debug!("Enrolled user {} ({})", user.label, user.name);
        Ok(user)
    }

    pub fn get_user(&self, label: i64) -> StoreResult<Option<User>> {
        let conn = self.reader();
        let user = conn
            .query_row(
                "SELECT label, name, image_path, enrolled_at, updated_at
                 FROM users WHERE label = ?1",
                params![label],
                row_to_user,
            )
            .optional()?;
        user.transpose().map_err(StorageError::Corrupt)
    }

    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT label, name, image_path, enrolled_at, updated_at
             FROM users ORDER BY label",
        )?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?.map_err(StorageError::Corrupt)?);
        }
        Ok(users)
    }

    /// Append one event and return its row id.
    pub fn append_access_event(&self, event: &AccessEvent) -> StoreResult<i64> {
        let image = event
            .captured_image_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_log
                (timestamp, label, confidence, image_path, outcome, source,
                 error, image_persist_failed, degraded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                format_timestamp(&event.timestamp),
                event.matched_label,
                finite_confidence(event.confidence),
                image,
                event.outcome.as_str(),
                event.source.as_str(),
                event.error,
                event.image_persist_failed,
                event.degraded,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Newest-first listing constrained by `filter`.
    pub fn list_access_events(&self, filter: &EventFilter) -> StoreResult<Vec<AccessEvent>> {
        let mut sql = String::from(
            "SELECT id, timestamp, label, confidence, image_path, outcome, source,
                    error, image_persist_failed, degraded
             FROM access_log WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Text(format_timestamp(&since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Text(format_timestamp(&until)));
        }
        if let Some(label) = filter.label {
            sql.push_str(" AND label = ?");
            values.push(Value::Integer(label));
        }
        if let Some(outcome) = filter.outcome {
            sql.push_str(" AND outcome = ?");
            values.push(Value::Text(outcome.as_str().to_string()));
        }
        if let Some(source) = filter.source {
            sql.push_str(" AND source = ?");
            values.push(Value::Text(source.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        values.push(Value::Integer(filter.effective_limit() as i64));

        let conn = self.reader();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.map_err(StorageError::Corrupt)?);
        }
        Ok(events)
    }

    pub fn count_access_events(&self) -> StoreResult<i64> {
        let conn = self.reader();
        let count = conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Waits for any in-flight write, then closes every connection.
    pub fn close(self) -> StoreResult<()> {
        for reader in self.readers {
            let conn = reader.into_inner().unwrap_or_else(PoisonError::into_inner);
            conn.close().map_err(|(_, e)| e)?;
        }
        let writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);
        writer.close().map_err(|(_, e)| e)?;
        tracing::info!("Store closed");
        Ok(())
    }
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // WAL keeps readers on a committed snapshot while the writer appends
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label INTEGER UNIQUE NOT NULL,
            name TEXT NOT NULL,
            image_path TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS access_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            label INTEGER,
            confidence REAL NOT NULL,
            image_path TEXT,
            outcome TEXT NOT NULL CHECK (outcome IN ('admitted', 'denied')),
            source TEXT NOT NULL,
            error TEXT,
            image_persist_failed INTEGER NOT NULL DEFAULT 0,
            degraded INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_access_log_timestamp ON access_log(timestamp)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_access_log_label ON access_log(label)",
        [],
    )?;

    Ok(())
}

/// Fixed-width UTC so lexical order in SQLite matches chronological order.
/// The column is NOT NULL and SQLite stores NaN as NULL.
fn finite_confidence(confidence: f32) -> f64 {
    if confidence.is_finite() {
        confidence as f64
    } else {
        0.0
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", raw, e))
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<std::result::Result<User, String>> {
    let label: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let image_path: String = row.get(2)?;
    let enrolled_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok((|| {
        Ok(User {
            label,
            name,
            image_path: PathBuf::from(image_path),
            enrolled_at: parse_timestamp(&enrolled_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<std::result::Result<AccessEvent, String>> {
    let id: i64 = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let label: Option<i64> = row.get(2)?;
    let confidence: f64 = row.get(3)?;
    let image_path: Option<String> = row.get(4)?;
    let outcome: String = row.get(5)?;
    let source: String = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let image_persist_failed: bool = row.get(8)?;
    let degraded: bool = row.get(9)?;

    Ok((|| {
        Ok(AccessEvent {
            id: Some(id),
            timestamp: parse_timestamp(&timestamp)?,
            matched_label: label,
            confidence: confidence as f32,
            captured_image_path: image_path.map(PathBuf::from),
            outcome: outcome.parse::<Outcome>()?,
            source: source.parse::<EventSource>()?,
            error,
            image_persist_failed,
            degraded,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn event(label: Option<i64>, outcome: Outcome) -> AccessEvent {
        AccessEvent::new(outcome, label, 30.0, EventSource::Recognition)
    }

    #[test]
    fn reenrolling_a_label_updates_in_place() {
        let store = PersistentStore::open_in_memory().unwrap();

        let first = store.enroll_or_update_user(7, "alice", Path::new("user_images/7_alice.jpg")).unwrap();
        let second = store.enroll_or_update_user(7, "alicia", Path::new("user_images/7_alicia.jpg")).unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "alicia");
        assert_eq!(users[0].image_path, PathBuf::from("user_images/7_alicia.jpg"));
        assert_eq!(first.enrolled_at, second.enrolled_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn users_are_listed_by_label() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.enroll_or_update_user(9, "bob", Path::new("9_bob.png")).unwrap();
        store.enroll_or_update_user(2, "carol", Path::new("2_carol.png")).unwrap();

        let labels: Vec<i64> = store.list_users().unwrap().iter().map(|u| u.label).collect();
        assert_eq!(labels, vec![2, 9]);
        assert!(store.get_user(3).unwrap().is_none());
        assert_eq!(store.get_user(9).unwrap().unwrap().name, "bob");
    }

    #[test]
    fn hostile_names_are_stored_verbatim() {
        let store = PersistentStore::open_in_memory().unwrap();
        let name = "x'); DROP TABLE users; --";
        store.enroll_or_update_user(1, name, Path::new("1_x.jpg")).unwrap();
        assert_eq!(store.list_users().unwrap()[0].name, name);
    }

    #[test]
    fn events_round_trip_with_annotations() {
        let store = PersistentStore::open_in_memory().unwrap();
        let mut original = event(None, Outcome::Denied).with_error("inference failed: timeout");
        original.image_persist_failed = true;

        let id = store.append_access_event(&original).unwrap();
        let events = store.list_access_events(&EventFilter::default()).unwrap();

        assert_eq!(events.len(), 1);
        let stored = &events[0];
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.matched_label, None);
        assert_eq!(stored.outcome, Outcome::Denied);
        assert_eq!(stored.error.as_deref(), Some("inference failed: timeout"));
        assert!(stored.image_persist_failed);
        assert!(!stored.degraded);
        assert_eq!(stored.timestamp, original.timestamp);
    }

    #[test]
    fn non_finite_confidence_is_stored_as_zero() {
        let store = PersistentStore::open_in_memory().unwrap();
        let mut nan = event(Some(3), Outcome::Denied);
        nan.confidence = f32::NAN;
        let mut inf = event(Some(4), Outcome::Denied);
        inf.confidence = f32::INFINITY;

        store.append_access_event(&nan).unwrap();
        store.append_access_event(&inf).unwrap();

        let events = store.list_access_events(&EventFilter::default()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.confidence == 0.0));
    }

    #[test]
    fn filters_combine() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.append_access_event(&event(Some(3), Outcome::Admitted)).unwrap();
        store.append_access_event(&event(Some(3), Outcome::Denied)).unwrap();
        store.append_access_event(&event(Some(4), Outcome::Admitted)).unwrap();
        store
            .append_access_event(&AccessEvent::admitted(None, 0.0, EventSource::Remote))
            .unwrap();

        let label_three = EventFilter { label: Some(3), ..Default::default() };
        assert_eq!(store.list_access_events(&label_three).unwrap().len(), 2);

        let admitted_three = EventFilter {
            label: Some(3),
            outcome: Some(Outcome::Admitted),
            ..Default::default()
        };
        assert_eq!(store.list_access_events(&admitted_three).unwrap().len(), 1);

        let remote = EventFilter { source: Some(EventSource::Remote), ..Default::default() };
        let remote_events = store.list_access_events(&remote).unwrap();
        assert_eq!(remote_events.len(), 1);
        assert_eq!(remote_events[0].matched_label, None);

        let limited = EventFilter { limit: Some(2), ..Default::default() };
        let newest = store.list_access_events(&limited).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].source, EventSource::Remote);
    }

    #[test]
    fn time_window_filter() {
        let store = PersistentStore::open_in_memory().unwrap();
        let mut old = event(Some(1), Outcome::Denied);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.append_access_event(&old).unwrap();
        store.append_access_event(&event(Some(1), Outcome::Admitted)).unwrap();

        let recent = EventFilter {
            since: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        let events = store.list_access_events(&recent).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Admitted);

        let older = EventFilter {
            until: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(store.list_access_events(&older).unwrap().len(), 1);
    }

    #[test]
    fn readers_never_see_partial_rows_under_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            PersistentStore::open(&dir.path().join("lock.db"), &StoreOptions::default()).unwrap(),
        );

        let mut writers = Vec::new();
        for w in 0..4i64 {
            let store = Arc::clone(&store);
            writers.push(thread::spawn(move || {
                for i in 0..25i64 {
                    store.append_access_event(&event(Some(w), Outcome::Admitted)).unwrap();
                    store
                        .enroll_or_update_user(w, &format!("user-{}-{}", w, i), Path::new("img.jpg"))
                        .unwrap();
                }
            }));
        }

        let reader_store = Arc::clone(&store);
        let reader = thread::spawn(move || {
            let mut last_seen = 0usize;
            for _ in 0..50 {
                let filter = EventFilter { limit: Some(1000), ..Default::default() };
                let events = reader_store.list_access_events(&filter).unwrap();
                assert!(events.len() >= last_seen);
                for e in &events {
                    assert!(e.matched_label.is_some());
                    assert_eq!(e.outcome, Outcome::Admitted);
                }
                last_seen = events.len();
                let users = reader_store.list_users().unwrap();
                assert!(users.len() <= 4);
            }
        });

        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(store.count_access_events().unwrap(), 100);
        assert_eq!(store.list_users().unwrap().len(), 4);

        let store = Arc::try_unwrap(store).ok().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn reopening_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lock.db");

        let store = PersistentStore::open(&path, &StoreOptions::default()).unwrap();
        store.enroll_or_update_user(5, "dana", Path::new("5_dana.jpg")).unwrap();
        store.append_access_event(&event(Some(5), Outcome::Admitted)).unwrap();
        store.close().unwrap();

        let reopened = PersistentStore::open(&path, &StoreOptions::default()).unwrap();
        assert_eq!(reopened.list_users().unwrap().len(), 1);
        assert_eq!(reopened.count_access_events().unwrap(), 1);
    }
}
