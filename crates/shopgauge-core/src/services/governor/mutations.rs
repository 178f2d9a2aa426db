//! Mutation manager
//!
//! Tracks write-style calls between registration and resolution. A mutation
//! may carry an optimistic [`StatePatch`]; it is applied on registration and
//! the inverse patch the store hands back becomes the rollback.
//!
//! ```text
//! register ──► pending ──┬── complete ──► removed (no rollback)
//!                        └── fail ──────► removed ──► rollback ──► notify
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::notifications::NotificationSystem;
use super::state_store::{StatePatch, StateStore};
use super::types::{NotificationKind, NotificationTopic};

/// A registered, unresolved mutation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOperation {
    pub id: String,
    /// Registration order
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub payload: Value,
    /// Inverse of the applied optimistic patch
    pub rollback: Option<StatePatch>,
    #[serde(skip)]
    registered_at: Instant,
}

impl MutationOperation {
    /// Time since registration
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Pending-mutation registry with rollback on failure
pub struct MutationManager {
    pending: RwLock<HashMap<String, MutationOperation>>,
    store: Arc<dyn StateStore>,
    notifications: Option<Arc<NotificationSystem>>,
    next_sequence: AtomicU64,
}

impl MutationManager {
    pub fn new(store: Arc<dyn StateStore>, notifications: Option<Arc<NotificationSystem>>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            store,
            notifications,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// State store optimistic patches are applied to
    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Register a mutation, applying `optimistic_update` right away
    ///
    /// A patch the store refuses is logged and dropped; the mutation is still
    /// registered, without a rollback.
    pub async fn register_mutation(
        &self,
        name: impl Into<String>,
        payload: Value,
        optimistic_update: Option<StatePatch>,
    ) -> String {
        let name = name.into();
        let id = uuid::Uuid::new_v4().to_string();

        let rollback = optimistic_update.and_then(|patch| match self.store.apply(&patch) {
            Ok(inverse) => Some(inverse),
            Err(e) => {
                log::warn!(
                    "[governor:mutations] Optimistic update for '{}' failed: {}",
                    name,
                    e
                );
                None
            }
        });

        let operation = MutationOperation {
            id: id.clone(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
            name,
            payload,
            rollback,
            registered_at: Instant::now(),
        };

        log::debug!(
            "[governor:mutations] Registered '{}' ({})",
            operation.name,
            operation.id
        );
        self.pending.write().await.insert(id.clone(), operation);
        id
    }

    /// Resolve a mutation as successful; never rolls back
    pub async fn complete_mutation(
        &self,
        id: &str,
        result: Option<&Value>,
    ) -> Option<MutationOperation> {
        let Some(operation) = self.pending.write().await.remove(id) else {
            log::warn!("[governor:mutations] Cannot complete unknown mutation {}", id);
            return None;
        };

        log::debug!(
            "[governor:mutations] Completed '{}' ({}){}",
            operation.name,
            operation.id,
            if result.is_some() { " with result" } else { "" }
        );
        Some(operation)
    }

    /// Resolve a mutation as failed, rolling back its optimistic update
    ///
    /// The entry is removed before the rollback runs, so a concurrent or late
    /// second failure finds nothing and is a no-op.
    pub async fn fail_mutation(
        &self,
        id: &str,
        error: impl Display,
    ) -> Option<MutationOperation> {
        let Some(operation) = self.pending.write().await.remove(id) else {
            log::warn!("[governor:mutations] Cannot fail unknown mutation {}", id);
            return None;
        };

        log::warn!(
            "[governor:mutations] '{}' ({}) failed: {}",
            operation.name,
            operation.id,
            error
        );

        let rollback_error = operation
            .rollback
            .as_ref()
            .and_then(|patch| self.store.apply(patch).err());

        if let Some(notifications) = &self.notifications {
            notifications
                .notify(
                    format!("Mutation '{}' failed: {}", operation.name, error),
                    NotificationKind::Error,
                    NotificationTopic::Mutation,
                )
                .await;

            if let Some(e) = &rollback_error {
                notifications
                    .notify(
                        format!("Rollback of mutation '{}' failed: {}", operation.name, e),
                        NotificationKind::Error,
                        NotificationTopic::System,
                    )
                    .await;
            }
        }

        if let Some(e) = rollback_error {
            log::error!(
                "[governor:mutations] Rollback of '{}' ({}) failed: {}",
                operation.name,
                operation.id,
                e
            );
        }

        Some(operation)
    }

    /// Pending mutations in registration order
    pub async fn get_pending_mutations(&self) -> Vec<MutationOperation> {
        let mut operations: Vec<MutationOperation> =
            self.pending.read().await.values().cloned().collect();
        operations.sort_by_key(|op| op.sequence);
        operations
    }

    pub async fn get_pending_mutation(&self, id: &str) -> Option<MutationOperation> {
        self.pending.read().await.get(id).cloned()
    }

    pub async fn has_pending_mutations(&self) -> bool {
        !self.pending.read().await.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Drop every pending mutation without rolling back
    pub async fn clear_pending_mutations(&self) -> usize {
        let mut pending = self.pending.write().await;
        let cleared = pending.len();
        pending.clear();
        if cleared > 0 {
            log::info!("[governor:mutations] Cleared {} pending mutations", cleared);
        }
        cleared
    }

    /// Fail every mutation pending for at least `max_age`
    ///
    /// Returns the ids this sweep failed. Entries resolved concurrently are
    /// skipped.
    pub async fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let expired: Vec<String> = {
            let pending = self.pending.read().await;
            let mut expired: Vec<&MutationOperation> =
                pending.values().filter(|op| op.age() >= max_age).collect();
            expired.sort_by_key(|op| op.sequence);
            expired.into_iter().map(|op| op.id.clone()).collect()
        };

        let mut failed = Vec::with_capacity(expired.len());
        for id in expired {
            let reason = format!("timed out after {}s", max_age.as_secs());
            if self.fail_mutation(&id, reason).await.is_some() {
                failed.push(id);
            }
        }
        failed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// returned handle is shut down
    pub fn spawn_timeout_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_age: Duration,
    ) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        log::info!(
            "[governor:mutations] Starting timeout sweeper (every {:?}, max age {:?})",
            interval,
            max_age
        );

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // First tick fires immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let failed = self.sweep_expired(max_age).await;
                        if !failed.is_empty() {
                            log::info!("[governor:mutations] Timed out {} mutations", failed.len());
                        }
                    }
                    _ = &mut shutdown_rx => {
                        log::info!("[governor:mutations] Timeout sweeper received shutdown signal");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running timeout sweeper
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            log::warn!("[governor:mutations] Timeout sweeper ended abnormally: {}", e);
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
