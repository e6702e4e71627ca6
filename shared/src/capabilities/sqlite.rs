use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::kv::{KeyValueStore, KvError, KvKey, StorageErrorCode};

/// SQLite-backed key/value storage for hosts that already ship a database.
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKvStore").finish_non_exhaustive()
    }
}

impl SqliteKvStore {
    /// Open (or create) a database at the given path.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path).map_err(|e| sql_error("open", &e))?;
        Self::init_with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(|e| sql_error("open_in_memory", &e))?;
        Self::init_with_connection(conn)
    }

    fn init_with_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| sql_error("init_schema", &e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, KvError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection lock poisoned"))?;
            op(&guard)
        })
        .await?
    }
}

fn sql_error(context: &str, e: &rusqlite::Error) -> KvError {
    let code = match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(rusqlite::ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(rusqlite::ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase) => {
            StorageErrorCode::Corrupted
        }
        Some(rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, format!("{context}: {e}"))
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![raw],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|e| sql_error("get", &e))
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        KvError::check_size(&value)?;
        let raw = key.raw();
        debug!(key = %raw, bytes = value.len(), "writing sqlite value");
        let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![raw, value, now],
            )
            .map(|_| ())
            .map_err(|e| sql_error("set", &e))
        })
        .await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                .map(|changed| changed > 0)
                .map_err(|e| sql_error("delete", &e))
        })
        .await
    }
}
