//! In-memory checkpoint store backend.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::state::ExecutionState;

use super::{validate_thread_id, CheckpointStore};

/// Map-backed store for tests and single-process use.
///
/// Saves replace the whole record under a write lock, so a save followed by
/// a load always observes the complete state.
#[derive(Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored threads.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, state: &ExecutionState) -> Result<(), StoreError> {
        validate_thread_id(&state.thread_id)?;
        let mut states = self.states.write().await;
        states.insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<ExecutionState, StoreError> {
        let states = self.states.read().await;
        states
            .get(thread_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(thread_id.to_string()))
    }

    async fn delete(&self, thread_id: &str) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        states.remove(thread_id);
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let states = self.states.read().await;
        let mut threads: Vec<String> = states.keys().cloned().collect();
        threads.sort();
        Ok(threads)
    }
}
