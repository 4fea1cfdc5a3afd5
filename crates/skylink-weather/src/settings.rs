//! User preferences: API key and last searched city.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use skylink_core::{RusqliteErrorExt, StorageError};
use std::path::Path;

const API_KEY: &str = "api_key";
const LAST_SEARCHED_CITY: &str = "last_searched_city";

/// Preferences contract used by the upstream client and orchestrators.
pub trait Preferences: Send + Sync {
    /// User-saved key, else the configured fallback key (may be empty).
    fn api_key(&self) -> String;

    /// Last searched city, else the configured default city.
    fn last_city(&self) -> String;

    fn save_api_key(&self, api_key: &str) -> Result<(), StorageError>;

    fn save_last_city(&self, city: &str) -> Result<(), StorageError>;
}

/// Preferences stored as key/value rows in SQLite.
pub struct SqlitePreferences {
    conn: Mutex<Connection>,
    fallback_api_key: String,
    default_city: String,
}

impl SqlitePreferences {
    pub fn open<P: AsRef<Path>>(
        path: P,
        fallback_api_key: impl Into<String>,
        default_city: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let conn =
            Connection::open(path).map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Self::with_connection(conn, fallback_api_key.into(), default_city.into())
    }

    pub fn in_memory(
        fallback_api_key: impl Into<String>,
        default_city: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Self::with_connection(conn, fallback_api_key.into(), default_city.into())
    }

    fn with_connection(
        conn: Connection,
        fallback_api_key: String,
        default_city: String,
    ) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(RusqliteErrorExt::into_storage_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
            fallback_api_key,
            default_city,
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        let result = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional();

        match result {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read preference {}: {}", key, e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO preferences (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(RusqliteErrorExt::into_storage_error)?;
        Ok(())
    }
}

impl Preferences for SqlitePreferences {
    fn api_key(&self) -> String {
        self.get(API_KEY)
            .unwrap_or_else(|| self.fallback_api_key.clone())
    }

    fn last_city(&self) -> String {
        self.get(LAST_SEARCHED_CITY)
            .unwrap_or_else(|| self.default_city.clone())
    }

    fn save_api_key(&self, api_key: &str) -> Result<(), StorageError> {
        self.set(API_KEY, api_key)
    }

    fn save_last_city(&self, city: &str) -> Result<(), StorageError> {
        self.set(LAST_SEARCHED_CITY, city)
    }
}
