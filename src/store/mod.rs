//! Checkpoint persistence for execution state.
//!
//! The store owns exactly one [`ExecutionState`] record per thread id. A
//! `save` immediately followed by a `load` on the same thread returns an
//! equivalent state; no partial write is ever observable. Backends are
//! pluggable: [`MemoryStore`] for tests, [`FileStore`] for durable
//! single-node deployments.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::error::StoreError;
use crate::state::{ExecutionState, ThreadStatus};

/// Persistence contract for per-thread execution state.
///
/// Implementations must be safe for concurrent access across distinct
/// thread ids; per-thread call serialization is the orchestrator's job.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists the state under its thread id, replacing any prior record.
    async fn save(&self, state: &ExecutionState) -> Result<(), StoreError>;

    /// Loads the state for a thread.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists.
    async fn load(&self, thread_id: &str) -> Result<ExecutionState, StoreError>;

    /// Deletes the state for a thread. Deleting a missing thread is not an
    /// error.
    async fn delete(&self, thread_id: &str) -> Result<(), StoreError>;

    /// Lists all stored thread ids.
    async fn list_threads(&self) -> Result<Vec<String>, StoreError>;

    /// Deletes interrupted threads whose pending checkpoint is older than
    /// `ttl`, returning the number removed. Bounds store growth from
    /// abandoned interrupts.
    async fn sweep_expired(&self, ttl: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let mut removed = 0;

        for thread_id in self.list_threads().await? {
            let state = match self.load(&thread_id).await {
                Ok(state) => state,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let expired = state.status == ThreadStatus::Interrupted
                && state
                    .pending_interrupt
                    .as_ref()
                    .is_some_and(|p| p.raised_at < cutoff);
            if expired {
                tracing::info!(thread_id = %thread_id, "Expiring abandoned interrupt");
                self.delete(&thread_id).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Rejects thread ids that could escape a storage namespace.
pub(crate) fn validate_thread_id(thread_id: &str) -> Result<(), StoreError> {
    let valid = !thread_id.is_empty()
        && thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidThreadId(thread_id.to_string()))
    }
}
