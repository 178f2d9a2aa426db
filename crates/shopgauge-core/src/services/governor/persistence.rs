//! Persistence port and adapters
//!
//! Every persisting component (plan config, usage analytics, notifications)
//! talks to storage through the narrow [`Persistence`] contract: load a string
//! by key, save a string by key. Failures are always absorbed by the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::db::Database;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a persistence backend
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(String),

    /// Database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend is not usable (e.g. missing directory, closed pool)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

// ============================================================================
// Persistence Trait
// ============================================================================

/// Key/value storage used by the governor components
///
/// Implementations only move opaque strings; the components own the payload
/// format.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the value stored under `key`, `Ok(None)` when absent
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Store `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

// ============================================================================
// In-memory Adapter
// ============================================================================

/// Process-local storage, mostly useful for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value for `key` (for inspection in tests)
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// File Adapter
// ============================================================================

/// Stores each key as `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        // Write then rename so a crash never leaves a truncated payload
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ============================================================================
// SQLite Adapter
// ============================================================================

/// Stores keys in the `governor_state` table of the application database
#[derive(Clone)]
pub struct SqlitePersistence {
    db: Database,
}

impl SqlitePersistence {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM governor_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(value)
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO governor_state (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// PersistSlot
// ============================================================================

/// Best-effort, ordered persistence of one component's state
///
/// A component takes a ticket while it still holds its own write lock and
/// saves afterwards. Saves are serialized and a save whose ticket is older
/// than the last one written is skipped, so a stale payload never overwrites
/// a newer one.
pub(crate) struct PersistSlot {
    backend: Option<Arc<dyn Persistence>>,
    key: String,
    next_ticket: AtomicU64,
    last_written: Mutex<u64>,
}

impl PersistSlot {
    pub(crate) fn new(backend: Option<Arc<dyn Persistence>>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            next_ticket: AtomicU64::new(1),
            last_written: Mutex::new(0),
        }
    }

    /// A slot that never touches storage
    pub(crate) fn disabled(key: impl Into<String>) -> Self {
        Self::new(None, key)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Encode `state` and reserve its position in the save order
    ///
    /// Returns `None` when persistence is disabled or encoding fails.
    pub(crate) fn prepare<T: Serialize>(&self, state: &T) -> Option<PendingSave> {
        self.backend.as_ref()?;
        match serde_json::to_string(state) {
            Ok(payload) => Some(PendingSave {
                ticket: self.next_ticket.fetch_add(1, Ordering::SeqCst),
                payload,
            }),
            Err(e) => {
                log::warn!("[governor:persist] Failed to encode '{}': {}", self.key, e);
                None
            }
        }
    }

    /// Write a prepared payload; failures are logged and swallowed
    pub(crate) async fn commit(&self, pending: Option<PendingSave>) {
        let (Some(backend), Some(pending)) = (self.backend.as_ref(), pending) else {
            return;
        };

        let mut last_written = self.last_written.lock().await;
        if pending.ticket < *last_written {
            log::debug!(
                "[governor:persist] Skipping stale save #{} for '{}' (already wrote #{})",
                pending.ticket,
                self.key,
                *last_written
            );
            return;
        }

        match backend.save(&self.key, &pending.payload).await {
            Ok(()) => {
                *last_written = pending.ticket;
                log::debug!("[governor:persist] Saved '{}' (#{})", self.key, pending.ticket);
            }
            Err(e) => {
                log::warn!("[governor:persist] Failed to save '{}': {}", self.key, e);
            }
        }
    }

    /// Load and decode the stored state; any failure reads as `None`
    pub(crate) async fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let backend = self.backend.as_ref()?;

        let raw = match backend.load(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::debug!("[governor:persist] Nothing stored under '{}'", self.key);
                return None;
            }
            Err(e) => {
                log::warn!("[governor:persist] Failed to load '{}': {}", self.key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("[governor:persist] Ignoring unreadable '{}': {}", self.key, e);
                None
            }
        }
    }
}

/// Encoded state waiting to be written
pub(crate) struct PendingSave {
    ticket: u64,
    payload: String,
}

// ============================================================================
// Tests
// ============================================================================
