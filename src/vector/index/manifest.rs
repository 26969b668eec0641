//! Shard naming convention and completeness checks.
//!
//! A build with `worker_count` workers produces exactly one index shard and
//! one id file per rank in `0..worker_count`:
//!
//! ```text
//! faiss/item_index/part_<worker_count>_<rank>.dat
//! faiss/item_ids/part_<worker_count>_<rank>.dat
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GlaiveError, Result};
use crate::storage::Storage;

/// Root of the exported tree, relative to the model path.
pub const FAISS_DIR: &str = "faiss/";

/// Directory holding serialized index shards.
pub const INDEX_DIR: &str = "faiss/item_index/";

/// Directory holding id files.
pub const IDS_DIR: &str = "faiss/item_ids/";

static SHARD_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^part_(\d+)_(\d+)\.dat$").expect("shard file pattern is valid")
});

/// Identity of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub worker_count: usize,
    pub rank: usize,
}

impl ShardId {
    pub fn new(worker_count: usize, rank: usize) -> Self {
        Self { worker_count, rank }
    }

    /// `part_<worker_count>_<rank>.dat`
    pub fn file_name(&self) -> String {
        format!("part_{}_{}.dat", self.worker_count, self.rank)
    }

    /// Parse a shard file name, ignoring any directory prefix.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let captures = SHARD_FILE_PATTERN.captures(base)?;
        Some(Self {
            worker_count: captures[1].parse().ok()?,
            rank: captures[2].parse().ok()?,
        })
    }

    /// Storage name of this shard's serialized index.
    pub fn index_path(&self) -> String {
        format!("{INDEX_DIR}{}", self.file_name())
    }

    /// Storage name of this shard's id file.
    pub fn ids_path(&self) -> String {
        format!("{IDS_DIR}{}", self.file_name())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part_{}_{}", self.worker_count, self.rank)
    }
}

/// The declared set of shards for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    worker_count: usize,
}

impl ShardManifest {
    /// Declare `worker_count` shards. Zero workers is rejected.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(GlaiveError::config(
                "worker_count",
                "0",
                "must be a positive integer",
            ));
        }
        Ok(Self { worker_count })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Every declared shard, in rank order.
    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.worker_count).map(|rank| ShardId::new(self.worker_count, rank))
    }

    /// Shard identity of `rank`.
    pub fn shard(&self, rank: usize) -> Result<ShardId> {
        if rank >= self.worker_count {
            return Err(GlaiveError::invalid_argument(format!(
                "rank {rank} out of range for worker_count {}",
                self.worker_count
            )));
        }
        Ok(ShardId::new(self.worker_count, rank))
    }

    /// Ranks whose index shard does not exist in `storage`.
    pub fn missing_ranks(&self, storage: &dyn Storage) -> Vec<usize> {
        self.shards()
            .filter(|shard| !storage.file_exists(&shard.index_path()))
            .map(|shard| shard.rank)
            .collect()
    }

    /// Fail with every missing rank unless all declared shards exist.
    pub fn ensure_complete(&self, storage: &dyn Storage) -> Result<()> {
        let ranks = self.missing_ranks(storage);
        if ranks.is_empty() {
            Ok(())
        } else {
            Err(GlaiveError::ShardMissing {
                worker_count: self.worker_count,
                ranks,
            })
        }
    }

    /// Shard files in `storage` that this manifest does not declare.
    ///
    /// These are leftovers of builds with a different worker count. They are
    /// never loaded; callers only report them.
    pub fn stray_shards(&self, storage: &dyn Storage) -> Result<Vec<ShardId>> {
        let strays = storage
            .list_files(INDEX_DIR)?
            .iter()
            .filter_map(|name| ShardId::parse_file_name(name))
            .filter(|shard| shard.worker_count != self.worker_count || shard.rank >= self.worker_count)
            .collect();
        Ok(strays)
    }

    /// Log stray shards at warn level.
    pub fn warn_strays(&self, storage: &dyn Storage) -> Result<()> {
        for shard in self.stray_shards(storage)? {
            warn!(
                shard = %shard,
                worker_count = self.worker_count,
                "ignoring shard outside the declared manifest"
            );
        }
        Ok(())
    }
}
