use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;

use crate::error::AppError;

const DB_FILE_NAME: &str = "raspctl.db";

/// Key-value storage the GPIO manager and the response cache sit on.
///
/// `get` returns `Ok(None)` for keys that were never written and for keys
/// whose TTL has elapsed.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError>;
    fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), AppError>;
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

fn lookup(entries: &RwLock<FxHashMap<String, Entry>>, key: &str) -> Option<Vec<u8>> {
    let now = Instant::now();
    {
        let map = entries.read();
        match map.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
    }

    // lazily purge, re-checking in case a writer refreshed the entry meanwhile
    let mut map = entries.write();
    if map.get(key).is_some_and(|e| e.is_expired(now)) {
        map.remove(key);
        debug!("store: purged expired key {key}");
    }
    map.get(key).map(|e| e.value.clone())
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<FxHashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        Ok(lookup(&self.entries, key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), AppError> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }
}

/// Store backed by an SQLite database under a directory.
///
/// Every value, TTL'd or not, lives only in the `kv` table; expiry is a
/// wall-clock deadline in milliseconds so it survives restarts.
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::Persistence(format!("{context}: {e}"))
}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, AppError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            AppError::Persistence(format!("create store dir {}: {e}", dir.display()))
        })?;
        let path = dir.join(DB_FILE_NAME);

        let conn = Connection::open(&path).map_err(db_err("open store"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER
            )",
            [],
        )
        .map_err(db_err("create kv table"))?;

        let purged = conn
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![unix_millis(SystemTime::now())],
            )
            .map_err(db_err("purge expired keys"))?;
        if purged > 0 {
            debug!("store: purged {purged} expired keys on open");
        }

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn upsert(&self, key: &str, value: &[u8], expires_at: Option<i64>) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )
        .map_err(db_err("write key"))?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let now = unix_millis(SystemTime::now());
        let conn = self.conn.lock();
        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err("read key"))?;

        match row {
            Some((_, Some(deadline))) if deadline <= now => {
                conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
                    params![key, now],
                )
                .map_err(db_err("purge expired key"))?;
                debug!("store: purged expired key {key}");
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError> {
        self.upsert(key, value, None)
    }

    fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), AppError> {
        let deadline = SystemTime::now() + ttl;
        self.upsert(key, value, Some(unix_millis(deadline)))
    }
}
