//! Query-side retrieval.
//!
//! A [`RetrievalWorker`] embeds its partition of the query dataset and
//! searches the shared assembled index, emitting exactly one [`SearchRow`] per
//! query row in input order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::RetrievalConfig;
use crate::dataset::{Dataset, Minibatch};
use crate::error::{GlaiveError, Result};
use crate::model::Tower;
use crate::vector::index::AnnIndex;

/// Search output for one query row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRow {
    /// Surrogate key of the query row.
    pub key: u64,
    /// Candidate ids, best first.
    pub indices: Vec<u64>,
    /// Distances aligned with `indices`.
    pub distances: Vec<f32>,
}

impl SearchRow {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Everything a retrieval worker needs, passed explicitly to each call.
#[derive(Clone)]
pub struct RetrievalContext {
    pub config: Arc<RetrievalConfig>,
    pub tower: Arc<dyn Tower>,
    pub index: Arc<dyn AnnIndex>,
    pub rank: usize,
}

impl fmt::Debug for RetrievalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalContext")
            .field("rank", &self.rank)
            .field("tower", &self.tower)
            .field("ntotal", &self.index.ntotal())
            .finish()
    }
}

/// Searches the assembled index for one partition of queries.
#[derive(Debug)]
pub struct RetrievalWorker {
    rank: usize,
    rows: Vec<SearchRow>,
}

impl RetrievalWorker {
    #[instrument(skip(context), fields(rank = context.rank))]
    pub fn start(context: &RetrievalContext) -> Result<Self> {
        if context.tower.output_dimension() != context.index.dimension() {
            return Err(GlaiveError::model(format!(
                "query tower produces dimension {} but the index has dimension {}",
                context.tower.output_dimension(),
                context.index.dimension()
            )));
        }
        info!(ntotal = context.index.ntotal(), "retrieval worker started");
        Ok(Self {
            rank: context.rank,
            rows: Vec::new(),
        })
    }

    /// Embed one minibatch and search it. Returns the number of rows emitted.
    pub async fn process_minibatch(
        &mut self,
        context: &RetrievalContext,
        batch: &Minibatch<'_>,
    ) -> Result<usize> {
        let config = &context.config;
        let keys = batch.ids(&config.increasing_id_column_name)?;
        let embeddings = context.tower.encode(batch).await?;
        if embeddings.len() != batch.len() {
            return Err(GlaiveError::model(format!(
                "query tower returned {} embeddings for {} rows",
                embeddings.len(),
                batch.len()
            )));
        }

        let index = Arc::clone(&context.index);
        let k = config.retrieval_item_count;
        let results = tokio::task::spawn_blocking(move || index.search(&embeddings, k))
            .await
            .map_err(|err| GlaiveError::other(format!("search task failed: {err}")))??;
        if results.len() != keys.len() {
            return Err(GlaiveError::other(format!(
                "index returned {} result lists for {} queries",
                results.len(),
                keys.len()
            )));
        }

        let emitted = results.len();
        self.rows
            .extend(keys.into_iter().zip(results).map(|(key, neighbors)| SearchRow {
                key,
                indices: neighbors.ids,
                distances: neighbors.distances,
            }));
        debug!(rank = self.rank, emitted, "searched minibatch");
        Ok(emitted)
    }

    /// Finish and hand back every emitted row in input order.
    pub fn stop(self) -> Vec<SearchRow> {
        info!(rank = self.rank, rows = self.rows.len(), "retrieval worker stopped");
        self.rows
    }

    /// Search a whole partition.
    pub async fn run(context: RetrievalContext, partition: Dataset) -> Result<Vec<SearchRow>> {
        let mut worker = Self::start(&context)?;
        for batch in partition.minibatches(context.config.minibatch_size) {
            worker.process_minibatch(&context, &batch).await?;
        }
        Ok(worker.stop())
    }
}

/// Output rows grouped by result-list length.
///
/// Used to sanity-check the shape of a validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCountSummary {
    counts: BTreeMap<usize, usize>,
}

impl RowCountSummary {
    pub fn from_rows(rows: &[SearchRow]) -> Self {
        let mut counts = BTreeMap::new();
        for row in rows {
            *counts.entry(row.len()).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Number of rows whose list has `length` entries.
    pub fn count(&self, length: usize) -> usize {
        self.counts.get(&length).copied().unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.counts.values().sum()
    }

    /// `(list length, row count)` pairs, ascending by length.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.counts.iter().map(|(length, count)| (*length, *count))
    }

    pub fn log(&self) {
        for (length, count) in self.iter() {
            info!(length, count, "retrieval rows by list length");
        }
    }
}

impl fmt::Display for RowCountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8} | {:>8}", "length", "count")?;
        for (length, count) in self.iter() {
            writeln!(f, "{length:>8} | {count:>8}")?;
        }
        Ok(())
    }
}
