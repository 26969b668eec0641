//! Index shard building.
//!
//! One [`ShardBuildingWorker`] runs per `(worker_count, rank)`. It embeds its
//! partition of the candidate dataset, adds every embedding to a local
//! [`FlatIndex`] under the candidate's declared id, and streams one id-file
//! line per candidate. Stopping the worker persists the shard.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::config::RetrievalConfig;
use crate::dataset::{Dataset, Minibatch, Value};
use crate::error::{GlaiveError, Result};
use crate::model::Tower;
use crate::storage::{SharedStorage, StorageOutput, write_file};
use crate::vector::core::distance::DistanceMetric;
use crate::vector::core::vector::Vector;
use crate::vector::index::AnnIndex;
use crate::vector::index::flat::FlatIndex;
use crate::vector::index::io::encode_shard;
use crate::vector::index::manifest::ShardId;
use crate::worker::id_file::IdFileFormat;

/// A candidate as it is indexed and written to the id file.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub candidate_id: u64,
    pub embedding: Vector,
    /// Values of the configured metadata columns, `None` for nulls.
    pub metadata: Vec<Option<String>>,
}

impl CandidateRecord {
    /// Pair each row of `batch` with its embedding.
    pub fn from_minibatch(
        config: &RetrievalConfig,
        batch: &Minibatch<'_>,
        embeddings: Vec<Vector>,
    ) -> Result<Vec<Self>> {
        if embeddings.len() != batch.len() {
            return Err(GlaiveError::model(format!(
                "candidate tower returned {} embeddings for {} rows",
                embeddings.len(),
                batch.len()
            )));
        }

        let ids = batch.ids(&config.item_id_column_name)?;
        let metadata_columns = config
            .item_ids_column_indices
            .iter()
            .map(|index| batch.column(*index).map(|column| column.collect::<Vec<_>>()))
            .collect::<Result<Vec<Vec<&Value>>>>()?;

        Ok(ids
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(row, (candidate_id, embedding))| CandidateRecord {
                candidate_id,
                embedding,
                metadata: metadata_columns
                    .iter()
                    .map(|column| match column[row] {
                        Value::Null => None,
                        value => Some(value.to_string()),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Everything a build worker needs, passed explicitly to each call.
#[derive(Clone)]
pub struct BuildContext {
    pub config: Arc<RetrievalConfig>,
    pub tower: Arc<dyn Tower>,
    /// Storage rooted at the model path the shards belong to.
    pub storage: SharedStorage,
    pub shard: ShardId,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("shard", &self.shard)
            .field("tower", &self.tower)
            .field("storage", &self.storage)
            .finish()
    }
}

/// What a finished build worker persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    pub shard: ShardId,
    /// Vectors in the persisted shard.
    pub ntotal: usize,
    /// Size of the id file in bytes.
    pub id_file_bytes: u64,
}

/// Builds and persists one index shard and its id file.
#[derive(Debug)]
pub struct ShardBuildingWorker {
    shard: ShardId,
    format: IdFileFormat,
    index: FlatIndex,
    ids_stream: Box<dyn StorageOutput>,
}

impl ShardBuildingWorker {
    /// Open the id-file stream and an empty shard.
    ///
    /// Any existing shard of the same identity is replaced when the worker
    /// stops.
    #[instrument(skip(context), fields(worker_count = context.shard.worker_count, rank = context.shard.rank))]
    pub fn start(context: &BuildContext) -> Result<Self> {
        let dimension = context.config.item_embedding_size;
        if context.tower.output_dimension() != dimension {
            return Err(GlaiveError::model(format!(
                "candidate tower produces dimension {} but item_embedding_size is {dimension}",
                context.tower.output_dimension()
            )));
        }

        let ids_stream = context.storage.create_output(&context.shard.ids_path())?;
        info!(shard = %context.shard, "index building worker started");
        Ok(Self {
            shard: context.shard,
            format: IdFileFormat::from(context.config.as_ref()),
            index: FlatIndex::new(dimension, DistanceMetric::L2),
            ids_stream,
        })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Vectors added so far.
    pub fn ntotal(&self) -> usize {
        self.index.ntotal()
    }

    /// Embed one minibatch, append its id lines and add it to the shard.
    pub async fn process_minibatch(
        &mut self,
        context: &BuildContext,
        batch: &Minibatch<'_>,
    ) -> Result<usize> {
        let embeddings = context.tower.encode(batch).await?;
        let records = CandidateRecord::from_minibatch(&context.config, batch, embeddings)?;
        self.add_records(&records)?;
        Ok(records.len())
    }

    /// Append already embedded records.
    pub fn add_records(&mut self, records: &[CandidateRecord]) -> Result<()> {
        let mut lines = String::new();
        for record in records {
            self.format.write_line(
                &mut lines,
                record.candidate_id,
                &record.metadata,
                &record.embedding,
            );
        }

        let ids: Vec<u64> = records.iter().map(|record| record.candidate_id).collect();
        let embeddings: Vec<Vector> = records.iter().map(|record| record.embedding.clone()).collect();
        self.index.add_with_ids(&embeddings, &ids)?;
        self.ids_stream.write_all(lines.as_bytes())?;

        debug!(shard = %self.shard, added = records.len(), "added minibatch");
        Ok(())
    }

    /// Close the id file and persist the shard.
    #[instrument(skip(self, context), fields(worker_count = self.shard.worker_count, rank = self.shard.rank))]
    pub fn stop(mut self, context: &BuildContext) -> Result<BuildReport> {
        let id_file_bytes = self.ids_stream.position()?;
        self.ids_stream.close()?;

        let bytes = encode_shard(&self.index)?;
        write_file(context.storage.as_ref(), &self.shard.index_path(), &bytes)?;

        info!(
            shard = %self.shard,
            ntotal = self.index.ntotal(),
            "index shard persisted"
        );
        Ok(BuildReport {
            shard: self.shard,
            ntotal: self.index.ntotal(),
            id_file_bytes,
        })
    }

    /// Build the shard of `context` from a whole partition.
    pub async fn run(context: BuildContext, partition: Dataset) -> Result<BuildReport> {
        let mut worker = Self::start(&context)?;
        for batch in partition.minibatches(context.config.minibatch_size) {
            worker.process_minibatch(&context, &batch).await?;
        }
        worker.stop(&context)
    }
}
