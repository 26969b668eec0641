//! Loads every shard declared by a manifest into one [`ShardedIndex`].

use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::error::{GlaiveError, Result};
use crate::storage::{SharedStorage, read_file};
use crate::vector::core::distance::DistanceMetric;
use crate::vector::index::AnnIndex;
use crate::vector::index::flat::FlatIndex;
use crate::vector::index::io::decode_shard;
use crate::vector::index::manifest::{ShardId, ShardManifest};
use crate::vector::index::sharded::ShardedIndex;

/// Builds the serving-time index from persisted shards.
#[derive(Debug, Clone)]
pub struct ShardedIndexAssembler {
    storage: SharedStorage,
    manifest: ShardManifest,
    expected_dimension: Option<usize>,
}

impl ShardedIndexAssembler {
    pub fn new(storage: SharedStorage, manifest: ShardManifest) -> Self {
        Self {
            storage,
            manifest,
            expected_dimension: None,
        }
    }

    /// Require every shard to have this dimension.
    pub fn with_expected_dimension(mut self, dimension: usize) -> Self {
        self.expected_dimension = Some(dimension);
        self
    }

    pub fn manifest(&self) -> &ShardManifest {
        &self.manifest
    }

    fn load_shard(&self, shard: ShardId) -> Result<FlatIndex> {
        let bytes = read_file(self.storage.as_ref(), &shard.index_path())?;
        let index = decode_shard(&bytes).map_err(|err| {
            GlaiveError::shard_corrupt(shard.worker_count, shard.rank, err.to_string())
        })?;

        if index.metric() != DistanceMetric::L2 {
            return Err(GlaiveError::shard_corrupt(
                shard.worker_count,
                shard.rank,
                format!("metric {} is not l2", index.metric().name()),
            ));
        }

        if let Some(expected) = self.expected_dimension
            && index.dimension() != expected
        {
            return Err(GlaiveError::shard_corrupt(
                shard.worker_count,
                shard.rank,
                format!(
                    "dimension {} does not match embedding size {expected}",
                    index.dimension()
                ),
            ));
        }

        debug!(shard = %shard, ntotal = index.ntotal(), "loaded shard");
        Ok(index)
    }

    /// Load all shards in rank order.
    ///
    /// Fails if any declared shard is missing, corrupt, not an L2 shard, or
    /// disagrees with the others on dimension. Shards of other worker counts found in
    /// the same directory are logged and ignored.
    #[instrument(skip(self), fields(worker_count = self.manifest.worker_count()))]
    pub fn assemble(&self) -> Result<ShardedIndex> {
        self.manifest.ensure_complete(self.storage.as_ref())?;
        self.manifest.warn_strays(self.storage.as_ref())?;

        let shards: Vec<ShardId> = self.manifest.shards().collect();
        let loaded = shards
            .par_iter()
            .map(|shard| self.load_shard(*shard))
            .collect::<Result<Vec<_>>>()?;

        let dimension = match loaded.first() {
            Some(first) => first.dimension(),
            None => self.expected_dimension.unwrap_or(0),
        };

        let mut index = ShardedIndex::new(dimension, DistanceMetric::L2);
        for (shard, flat) in shards.iter().zip(loaded) {
            index.add_shard(flat).map_err(|err| {
                GlaiveError::shard_corrupt(shard.worker_count, shard.rank, err.to_string())
            })?;
        }

        info!(
            shards = index.shard_count(),
            ntotal = index.ntotal(),
            dimension,
            "assembled sharded index"
        );
        Ok(index)
    }
}
