//! File-backed checkpoint store backend.
//!
//! One JSON file per thread under a root directory. Writes go to a
//! temporary sibling file and are renamed into place, so a concurrent load
//! never observes a partial record.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::state::ExecutionState;

use super::{validate_thread_id, CheckpointStore};

const STATE_EXTENSION: &str = "json";

/// Durable key-value store: `<root>/<thread_id>.json` per thread.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, thread_id: &str) -> PathBuf {
        self.root
            .join(thread_id)
            .with_extension(STATE_EXTENSION)
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn save(&self, state: &ExecutionState) -> Result<(), StoreError> {
        validate_thread_id(&state.thread_id)?;

        tokio::fs::create_dir_all(&self.root).await?;

        let contents = serde_json::to_vec_pretty(state)?;
        let final_path = self.state_path(&state.thread_id);
        let tmp_path = final_path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<ExecutionState, StoreError> {
        validate_thread_id(thread_id)?;

        let path = self.state_path(thread_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(thread_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&contents)?)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), StoreError> {
        validate_thread_id(thread_id)?;

        match tokio::fs::remove_file(self.state_path(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let mut threads = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(threads),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                threads.push(stem.to_string());
            }
        }

        threads.sort();
        Ok(threads)
    }
}
