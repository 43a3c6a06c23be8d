//! SQLite-backed identity store and attendance log.
//!
//! # Schema
//!
//! `identities(seq, handle, display_name, descriptor, model_version)`:
//! `seq` preserves insertion order for matching; `descriptor` is the raw
//! little-endian `f32` bytes and is NULL until enrollment, together with
//! `model_version`.
//!
//! `attendance(seq, id, handle, recorded_at, status, latitude, longitude)`:
//! append-only; `recorded_at` is RFC 3339 UTC with nanoseconds.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{
    AttendanceEvent, AttendanceSink, AttendanceStatus, Descriptor, GeoLocation, Identity,
    IdentityStore, StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    handle        TEXT NOT NULL UNIQUE,
    display_name  TEXT NOT NULL,
    descriptor    BLOB,
    model_version TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    handle      TEXT NOT NULL REFERENCES identities(handle),
    recorded_at TEXT NOT NULL,
    status      TEXT NOT NULL,
    latitude    REAL,
    longitude   REAL
);
CREATE INDEX IF NOT EXISTS attendance_by_handle ON attendance(handle, seq);
";

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Identity store and attendance sink over a single SQLite connection.
///
/// Every trait operation is one statement under the connection mutex, so a
/// descriptor replace is atomic and a listing is a consistent snapshot.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        tracing::debug!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, OpenError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OpenError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".into()))
    }

    /// Create an identity without a descriptor.
    pub fn create_identity(&self, handle: &str, display_name: &str) -> Result<Identity, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities (handle, display_name) VALUES (?1, ?2)",
            params![handle, display_name],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                StoreError::AlreadyExists(handle.to_string())
            } else {
                backend(e)
            }
        })?;
        tracing::info!(handle, "identity created");
        Ok(Identity::new(handle, display_name))
    }

    /// Every identity, enrolled or not, in insertion order.
    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.select_identities(
            "SELECT handle, display_name, descriptor, model_version
             FROM identities ORDER BY seq",
        )
    }

    /// Attendance events, newest first, optionally for one identity.
    pub fn attendance(
        &self,
        handle: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare(
                "SELECT id, handle, recorded_at, status, latitude, longitude
                 FROM attendance
                 WHERE ?1 IS NULL OR handle = ?1
                 ORDER BY seq DESC
                 LIMIT ?2",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![handle, limit], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    handle: row.get(1)?,
                    recorded_at: row.get(2)?,
                    status: row.get(3)?,
                    latitude: row.get(4)?,
                    longitude: row.get(5)?,
                })
            })
            .map_err(backend)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(backend)?.into_event()?);
        }
        Ok(events)
    }

    fn select_identities(&self, sql: &str) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt.query_map([], IdentityRow::from_row).map_err(backend)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row.map_err(backend)?.into_identity()?);
        }
        Ok(identities)
    }
}

impl IdentityStore for SqliteStore {
    fn find_by_handle(&self, handle: &str) -> Result<Identity, StoreError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT handle, display_name, descriptor, model_version
                 FROM identities WHERE handle = ?1",
                params![handle],
                IdentityRow::from_row,
            )
            .optional()
            .map_err(backend)?;
        match row {
            Some(row) => row.into_identity(),
            None => Err(StoreError::NotFound(handle.to_string())),
        }
    }

    fn list_with_descriptor(&self) -> Result<Vec<Identity>, StoreError> {
        self.select_identities(
            "SELECT handle, display_name, descriptor, model_version
             FROM identities WHERE descriptor IS NOT NULL ORDER BY seq",
        )
    }

    fn set_descriptor(&self, handle: &str, descriptor: &Descriptor) -> Result<(), StoreError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE identities SET descriptor = ?1, model_version = ?2 WHERE handle = ?3",
                params![
                    encode_descriptor(&descriptor.values),
                    descriptor.model_version,
                    handle
                ],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(handle.to_string()));
        }
        tracing::debug!(handle, dim = descriptor.len(), "descriptor stored");
        Ok(())
    }
}

impl AttendanceSink for SqliteStore {
    fn append(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        let (latitude, longitude) = match event.location {
            Some(loc) => (Some(loc.latitude), Some(loc.longitude)),
            None => (None, None),
        };
        self.conn()?
            .execute(
                "INSERT INTO attendance (id, handle, recorded_at, status, latitude, longitude)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.handle,
                    event.recorded_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    event.status.as_str(),
                    latitude,
                    longitude
                ],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    StoreError::NotFound(event.handle.clone())
                } else {
                    backend(e)
                }
            })?;
        Ok(())
    }
}

struct IdentityRow {
    handle: String,
    display_name: String,
    descriptor: Option<Vec<u8>>,
    model_version: Option<String>,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            handle: row.get(0)?,
            display_name: row.get(1)?,
            descriptor: row.get(2)?,
            model_version: row.get(3)?,
        })
    }

    fn into_identity(self) -> Result<Identity, StoreError> {
        let descriptor = match (self.descriptor, self.model_version) {
            (Some(bytes), Some(version)) => {
                let values = decode_descriptor(&bytes).ok_or_else(|| StoreError::Corrupt {
                    handle: self.handle.clone(),
                    reason: format!("descriptor blob of {} bytes", bytes.len()),
                })?;
                Some(Descriptor::new(values, version))
            }
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupt {
                    handle: self.handle,
                    reason: "descriptor without model version".into(),
                })
            }
        };
        Ok(Identity {
            handle: self.handle,
            display_name: self.display_name,
            descriptor,
        })
    }
}

struct EventRow {
    id: String,
    handle: String,
    recorded_at: String,
    status: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl EventRow {
    fn into_event(self) -> Result<AttendanceEvent, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            handle: self.handle.clone(),
            reason,
        };
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(format!("event id: {e}")))?;
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| corrupt(format!("recorded_at: {e}")))?
            .with_timezone(&Utc);
        let status = AttendanceStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Ok(AttendanceEvent {
            id,
            handle: self.handle,
            recorded_at,
            status,
            location,
        })
    }
}

fn encode_descriptor(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_descriptor(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION: &str = "test-v1";

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_identity("alice", "Alice").unwrap();
        store.create_identity("bob", "Bob").unwrap();
        store.create_identity("carol", "Carol").unwrap();
        store
    }

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec(), VERSION)
    }

    #[test]
    fn test_duplicate_identity() {
        let store = store();
        assert_eq!(
            store.create_identity("alice", "Other Alice"),
            Err(StoreError::AlreadyExists("alice".into()))
        );
    }

    #[test]
    fn test_find_unknown() {
        let store = store();
        assert_eq!(
            store.find_by_handle("zed"),
            Err(StoreError::NotFound("zed".into()))
        );
    }

    #[test]
    fn test_descriptor_roundtrip_exact() {
        let store = store();
        let descriptor = d(&[0.1, -0.333_333_34, 1e-7, f32::MAX, -0.0]);
        store.set_descriptor("bob", &descriptor).unwrap();

        let bob = store.find_by_handle("bob").unwrap();
        assert_eq!(bob.descriptor, Some(descriptor.clone()));

        let snapshot = store.list_with_descriptor().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].handle, "bob");
        assert_eq!(snapshot[0].descriptor, Some(descriptor));
    }

    #[test]
    fn test_snapshot_in_insertion_order() {
        let store = store();
        store.set_descriptor("carol", &d(&[0.3])).unwrap();
        store.set_descriptor("alice", &d(&[0.1])).unwrap();

        let handles: Vec<String> = store
            .list_with_descriptor()
            .unwrap()
            .into_iter()
            .map(|i| i.handle)
            .collect();
        assert_eq!(handles, vec!["alice", "carol"]);
        assert_eq!(store.list_identities().unwrap().len(), 3);
    }

    #[test]
    fn test_reenroll_replaces() {
        let store = store();
        store.set_descriptor("alice", &d(&[0.1, 0.2])).unwrap();
        store.set_descriptor("alice", &d(&[0.9, 0.8])).unwrap();

        let snapshot = store.list_with_descriptor().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].descriptor, Some(d(&[0.9, 0.8])));
    }

    #[test]
    fn test_set_descriptor_unknown() {
        let store = store();
        assert_eq!(
            store.set_descriptor("zed", &d(&[0.1])),
            Err(StoreError::NotFound("zed".into()))
        );
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let store = store();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE identities SET descriptor = x'010203', model_version = ?1 WHERE handle = 'bob'",
                params![VERSION],
            )
            .unwrap();
        assert!(matches!(
            store.list_with_descriptor(),
            Err(StoreError::Corrupt { ref handle, .. }) if handle == "bob"
        ));
    }

    #[test]
    fn test_attendance_append_and_query() {
        let store = store();
        let first = AttendanceEvent::present("alice", None);
        let second = AttendanceEvent::present(
            "bob",
            Some(GeoLocation {
                latitude: -7.25,
                longitude: 112.75,
            }),
        );
        let third = AttendanceEvent::present("alice", None);
        for e in [&first, &second, &third] {
            store.append(e).unwrap();
        }

        let all = store.attendance(None, 10).unwrap();
        assert_eq!(all, vec![third.clone(), second.clone(), first.clone()]);

        let alice = store.attendance(Some("alice"), 10).unwrap();
        assert_eq!(alice, vec![third.clone(), first]);

        let latest = store.attendance(None, 1).unwrap();
        assert_eq!(latest, vec![third]);
    }

    #[test]
    fn test_attendance_unknown_identity() {
        let store = store();
        let event = AttendanceEvent::present("zed", None);
        assert_eq!(store.append(&event), Err(StoreError::NotFound("zed".into())));
        assert!(store.attendance(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_partial_floats() {
        assert_eq!(decode_descriptor(&[]), None);
        assert_eq!(decode_descriptor(&[0, 0, 128]), None);
        assert_eq!(
            decode_descriptor(&encode_descriptor(&[1.5, -2.0])),
            Some(vec![1.5, -2.0])
        );
    }

    #[test]
    fn test_concurrent_enrollments_same_identity() {
        let store = store();
        let written: Vec<Descriptor> = (0..8).map(|i| d(&[i as f32; 64])).collect();

        std::thread::scope(|scope| {
            for descriptor in &written {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..25 {
                        store.set_descriptor("alice", descriptor).unwrap();
                    }
                });
            }
        });

        let stored = store.find_by_handle("alice").unwrap().descriptor.unwrap();
        assert!(written.contains(&stored), "interleaved write: {stored:?}");
    }
}
