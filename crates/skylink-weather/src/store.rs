//! SQLite-backed single-slot snapshot cache.
//!
//! Holds the most recent weather reading and the city it was fetched for.
//! Reads ignore age: a stale snapshot is still worth sending to the watch.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use skylink_core::{RusqliteErrorExt, StorageError};
use std::path::Path;

use crate::types::WeatherSnapshot;

/// Local snapshot store contract used by the orchestrators.
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot (last write wins).
    fn save(&self, snapshot: &WeatherSnapshot) -> Result<(), StorageError>;

    /// The stored snapshot regardless of age.
    fn load_any_age(&self) -> Result<Option<WeatherSnapshot>, StorageError>;

    /// City of the stored snapshot.
    fn last_city(&self) -> Result<Option<String>, StorageError>;

    /// When the stored snapshot was written.
    fn last_updated(&self) -> Result<Option<DateTime<Utc>>, StorageError>;
}

/// Snapshot store backed by one row of a SQLite table.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn =
            Connection::open(path).map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (tests and the paired demo).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS weather_snapshot (
                    slot INTEGER PRIMARY KEY CHECK (slot = 0),
                    snapshot_json TEXT NOT NULL,
                    city TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(RusqliteErrorExt::into_storage_error)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &WeatherSnapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = Utc::now().timestamp_millis();

        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO weather_snapshot (slot, snapshot_json, city, updated_at) VALUES (0, ?1, ?2, ?3)",
                params![json, snapshot.city, now],
            )
            .map_err(RusqliteErrorExt::into_storage_error)?;

        tracing::debug!("Cached weather snapshot for {}", snapshot.city);
        Ok(())
    }

    fn load_any_age(&self) -> Result<Option<WeatherSnapshot>, StorageError> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT snapshot_json FROM weather_snapshot WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_storage_error)?;

        match json {
            Some(json) => {
                let snapshot: WeatherSnapshot = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Corruption(e.to_string()))?;
                tracing::debug!("Retrieved cached weather (any age) for {}", snapshot.city);
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn last_city(&self) -> Result<Option<String>, StorageError> {
        self.conn
            .lock()
            .query_row(
                "SELECT city FROM weather_snapshot WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_storage_error)
    }

    fn last_updated(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let millis: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT updated_at FROM weather_snapshot WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_storage_error)?;

        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn london(temp: i32) -> WeatherSnapshot {
        WeatherSnapshot::new("London", temp, 70, 3.5, "Clouds", 1_700_000_000)
    }

    #[test]
    fn test_empty_store() {
        let store = SqliteSnapshotStore::in_memory().unwrap();
        assert!(store.load_any_age().unwrap().is_none());
        assert!(store.last_city().unwrap().is_none());
        assert!(store.last_updated().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let store = SqliteSnapshotStore::in_memory().unwrap();
        store.save(&london(15)).unwrap();

        assert_eq!(store.load_any_age().unwrap(), Some(london(15)));
        assert_eq!(store.last_city().unwrap().as_deref(), Some("London"));
        assert!(store.last_updated().unwrap().is_some());
    }

    #[test]
    fn test_last_write_wins() {
        let store = SqliteSnapshotStore::in_memory().unwrap();
        store.save(&london(15)).unwrap();
        let paris = WeatherSnapshot::new("Paris", 21, 40, 1.0, "Clear", 1_700_000_500);
        store.save(&paris).unwrap();

        assert_eq!(store.load_any_age().unwrap(), Some(paris));
        assert_eq!(store.last_city().unwrap().as_deref(), Some("Paris"));
    }

    #[test]
    fn test_old_snapshot_still_returned() {
        let store = SqliteSnapshotStore::in_memory().unwrap();
        let ancient = WeatherSnapshot::new("Lima", 19, 85, 2.0, "Mist", 0);
        store.save(&ancient).unwrap();
        assert_eq!(store.load_any_age().unwrap(), Some(ancient));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skylink.db");

        {
            let store = SqliteSnapshotStore::open(&path).unwrap();
            store.save(&london(12)).unwrap();
        }

        let reopened = SqliteSnapshotStore::open(&path).unwrap();
        assert_eq!(reopened.load_any_age().unwrap(), Some(london(12)));
    }
}
