//! SQLite-backed event store
//!
//! A single connection guarded by a mutex; every call runs on the blocking
//! pool. Uniqueness of the identity triple is enforced by the schema, so a
//! retransmitted event that slips past the in-process dedup check is still
//! stored once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{StorageError, StorageResult};
use super::store::EventStore;
use super::types::{DeviceLocation, DeviceRecord, Event, EventIdentity, InsertReport};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        device_id INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        device_ts INTEGER NOT NULL,
        type_code INTEGER NOT NULL,
        name TEXT NOT NULL,
        details TEXT NOT NULL,
        alert INTEGER NOT NULL,
        received_at TEXT NOT NULL,
        UNIQUE (device_id, sequence_id, device_ts)
    );
    CREATE INDEX IF NOT EXISTS idx_events_device ON events(device_id, device_ts);

    CREATE TABLE IF NOT EXISTS locations (
        device_id INTEGER PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        accuracy REAL,
        address TEXT,
        last_updated TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        device_id INTEGER NOT NULL,
        payload TEXT NOT NULL,
        received_at TEXT NOT NULL
    );
";

/// Event store on a local SQLite database
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Create or open the database file, creating parent directories
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = ?path, "Event store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StorageError::Lock(format!("Failed to acquire store lock: {}", e)))?;
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            f(conn)
        })
        .await?
    }

    pub async fn count_events(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn get_event(&self, identity: EventIdentity) -> StorageResult<Option<Event>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT type_code, name, details, alert, received_at FROM events
                     WHERE device_id = ?1 AND sequence_id = ?2 AND device_ts = ?3",
                    params![identity.device_id, identity.sequence_id, identity.device_ts],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((type_code, name, details, alert, received_at)) = row else {
                return Ok(None);
            };

            Ok(Some(Event {
                sequence_id: identity.sequence_id,
                device_id: identity.device_id,
                device_ts: identity.device_ts,
                type_code,
                name,
                details: serde_json::from_str(&details)?,
                alert,
                received_at: parse_timestamp(&received_at)?,
            }))
        })
        .await
    }

    pub async fn get_location(&self, device_id: i64) -> StorageResult<Option<DeviceLocation>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT latitude, longitude, accuracy, address, last_updated
                     FROM locations WHERE device_id = ?1",
                    params![device_id],
                    |row| {
                        Ok((
                            row.get::<_, f64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, Option<f64>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((latitude, longitude, accuracy, address, last_updated)) => {
                    Ok(Some(DeviceLocation {
                        device_id,
                        latitude,
                        longitude,
                        accuracy,
                        address,
                        last_updated: parse_timestamp(&last_updated)?,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Number of auxiliary records of one kind
    pub async fn count_records(&self, kind: &str) -> StorageResult<u64> {
        let kind = kind.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM device_records WHERE kind = ?1",
                params![kind],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {:?}: {}", raw, e)))
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn insert_events(&self, events: &[Event]) -> StorageResult<InsertReport> {
        if events.is_empty() {
            return Ok(InsertReport::default());
        }

        let rows = events
            .iter()
            .map(|e| {
                Ok((
                    e.device_id,
                    e.sequence_id,
                    e.device_ts,
                    e.type_code,
                    e.name.clone(),
                    serde_json::to_string(&e.details)?,
                    e.alert,
                    e.received_at.to_rfc3339(),
                ))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut report = InsertReport::default();
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO events
                     (device_id, sequence_id, device_ts, type_code, name, details, alert, received_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;

                for (device_id, sequence_id, device_ts, type_code, name, details, alert, received_at) in
                    &rows
                {
                    let changed = stmt.execute(params![
                        device_id,
                        sequence_id,
                        device_ts,
                        type_code,
                        name,
                        details,
                        alert,
                        received_at
                    ])?;
                    if changed == 0 {
                        report.ignored += 1;
                    } else {
                        report.inserted += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    async fn contains_event(&self, identity: &EventIdentity) -> StorageResult<bool> {
        let identity = *identity;
        self.with_conn(move |conn| {
            let found = conn
                .prepare_cached(
                    "SELECT 1 FROM events
                     WHERE device_id = ?1 AND sequence_id = ?2 AND device_ts = ?3",
                )?
                .exists(params![
                    identity.device_id,
                    identity.sequence_id,
                    identity.device_ts
                ])?;
            Ok(found)
        })
        .await
    }

    async fn upsert_location(&self, location: &DeviceLocation) -> StorageResult<()> {
        let location = location.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO locations (device_id, latitude, longitude, accuracy, address, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(device_id) DO UPDATE SET
                     latitude = excluded.latitude,
                     longitude = excluded.longitude,
                     accuracy = excluded.accuracy,
                     address = excluded.address,
                     last_updated = excluded.last_updated",
                params![
                    location.device_id,
                    location.latitude,
                    location.longitude,
                    location.accuracy,
                    location.address,
                    location.last_updated.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_record(&self, record: &DeviceRecord) -> StorageResult<()> {
        let kind = record.kind.as_str();
        let device_id = record.device_id;
        let payload = serde_json::to_string(&record.payload)?;
        let received_at = record.received_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO device_records (kind, device_id, payload, received_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![kind, device_id, payload, received_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        let conn = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || {
            conn.lock()
                .map(|mut guard| guard.take())
                .map_err(|e| StorageError::Lock(format!("Failed to acquire store lock: {}", e)))
        })
        .await??;

        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| StorageError::Database(e))?;
            tracing::info!(path = ?self.path, "Event store closed");
        }
        Ok(())
    }
}
