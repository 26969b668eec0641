//! Explicit materialization points between pipeline stages.
//!
//! The serving pipeline runs in two stages: retrieval needs the query tower
//! and the assembled index, reconstruction needs neither. Retrieval output is
//! written to a [`Checkpoint`] before the serving resources are released, and
//! reconstruction reads only the checkpoint. Only stages whose output is
//! materialized are named by [`Stage`].

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GlaiveError, Result};
use crate::storage::{SharedStorage, read_file, write_file};

/// Storage prefix of checkpoint snapshots.
pub const CHECKPOINT_DIR: &str = "checkpoints/";

/// Pipeline stages whose output is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Embed queries and search the assembled index.
    Retrieval,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Retrieval => "retrieval",
        }
    }
}

/// Metadata stored alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub id: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub rows: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot<T> {
    header: CheckpointHeader,
    payload: T,
}

/// A durable snapshot of one stage's output.
#[derive(Debug)]
pub struct Checkpoint<T> {
    storage: SharedStorage,
    name: String,
    header: CheckpointHeader,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Checkpoint<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Write `payload` to storage and return a handle to it.
    pub fn materialize(
        storage: SharedStorage,
        stage: Stage,
        payload: &T,
        rows: usize,
    ) -> Result<Self> {
        let header = CheckpointHeader {
            id: uuid::Uuid::new_v4().to_string(),
            stage,
            created_at: Utc::now(),
            rows,
        };
        let name = format!("{CHECKPOINT_DIR}{}_{}.bin", stage.name(), header.id);

        let bytes = bincode::serialize(&Snapshot {
            header: header.clone(),
            payload,
        })?;
        write_file(storage.as_ref(), &name, &bytes)?;
        storage.sync()?;

        info!(
            stage = stage.name(),
            rows,
            bytes = bytes.len(),
            checkpoint = %name,
            "materialized checkpoint"
        );
        Ok(Self {
            storage,
            name,
            header,
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &CheckpointHeader {
        &self.header
    }

    /// Read the snapshot back.
    pub fn load(&self) -> Result<T> {
        let bytes = read_file(self.storage.as_ref(), &self.name)?;
        let snapshot: Snapshot<T> = bincode::deserialize(&bytes)?;
        if snapshot.header != self.header {
            return Err(GlaiveError::storage(format!(
                "checkpoint {} was overwritten by {}",
                self.name, snapshot.header.id
            )));
        }
        debug!(checkpoint = %self.name, "loaded checkpoint");
        Ok(snapshot.payload)
    }

    /// Delete the snapshot.
    pub fn discard(self) -> Result<()> {
        self.storage.delete_file(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;
    use crate::worker::retrieval::SearchRow;

    fn rows() -> Vec<SearchRow> {
        vec![
            SearchRow {
                key: 0,
                indices: vec![3, 1],
                distances: vec![0.0, 0.5],
            },
            SearchRow {
                key: 1,
                indices: vec![],
                distances: vec![],
            },
        ]
    }

    #[test]
    fn test_materialize_then_load() {
        let storage = MemoryStorage::new_default();
        let checkpoint =
            Checkpoint::materialize(Arc::new(storage.clone()), Stage::Retrieval, &rows(), 2)
                .unwrap();

        assert!(checkpoint.name().starts_with("checkpoints/retrieval_"));
        assert!(storage.file_exists(checkpoint.name()));
        assert_eq!(checkpoint.header().rows, 2);
        assert_eq!(checkpoint.load().unwrap(), rows());

        let name = checkpoint.name().to_string();
        checkpoint.discard().unwrap();
        assert!(!storage.file_exists(&name));
    }

    #[test]
    fn test_checkpoint_names_are_unique() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new_default());
        let a = Checkpoint::materialize(storage.clone(), Stage::Retrieval, &rows(), 2).unwrap();
        let b = Checkpoint::materialize(storage, Stage::Retrieval, &rows(), 2).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_checkpoint_loads_on_blocking_pool() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new_default());
        let checkpoint = tokio::task::spawn_blocking(move || {
            Checkpoint::materialize(storage, Stage::Retrieval, &rows(), 2)
        })
        .await
        .unwrap()
        .unwrap();

        let loaded = tokio::task::spawn_blocking(move || {
            let loaded = checkpoint.load();
            checkpoint.discard().map(|_| loaded)
        })
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(loaded, rows());
    }

    #[test]
    fn test_truncated_snapshot_fails_to_load() {
        let storage = MemoryStorage::new_default();
        let checkpoint =
            Checkpoint::materialize(Arc::new(storage.clone()), Stage::Retrieval, &rows(), 2)
                .unwrap();
        storage.put(checkpoint.name(), vec![1, 2, 3]);
        assert!(checkpoint.load().is_err());
    }
}
