//! Two-tower model contract and its external collaborators.
//!
//! Training and model (de)serialization happen outside this crate. The
//! pipeline only needs to:
//!
//! - encode a minibatch with either tower ([`Tower`]),
//! - score query/candidate pairs ([`SimilarityScorer`]),
//! - run training to a model path ([`Trainer`]) and load the artifact back
//!   ([`ModelLoader`]).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dataset::{Dataset, Minibatch};
use crate::error::{GlaiveError, Result};
use crate::vector::core::distance::dot_product;
use crate::vector::core::vector::Vector;

/// An encoder mapping each row of a minibatch to one embedding.
#[async_trait]
pub trait Tower: Send + Sync + Debug {
    /// Dimension of the produced embeddings.
    fn output_dimension(&self) -> usize;

    /// Encode every row of `batch`, in row order.
    async fn encode(&self, batch: &Minibatch<'_>) -> Result<Vec<Vector>>;

    /// Reload dynamic vocabulary or column-name schemas after a model is
    /// loaded and before it is evaluated.
    fn reload_schema(&self) -> Result<()> {
        Ok(())
    }
}

/// Combines a query embedding and a candidate embedding into a score.
pub trait SimilarityScorer: Send + Sync + Debug {
    fn score(&self, query: &Vector, candidate: &Vector) -> Result<f32>;
}

/// Query tower, candidate tower and similarity scorer as one unit.
#[derive(Debug, Clone)]
pub struct TwoTowerModel {
    query_tower: Arc<dyn Tower>,
    candidate_tower: Arc<dyn Tower>,
    similarity: Arc<dyn SimilarityScorer>,
}

impl TwoTowerModel {
    pub fn new(
        query_tower: Arc<dyn Tower>,
        candidate_tower: Arc<dyn Tower>,
        similarity: Arc<dyn SimilarityScorer>,
    ) -> Result<Self> {
        if query_tower.output_dimension() != candidate_tower.output_dimension() {
            return Err(GlaiveError::model(format!(
                "query tower produces dimension {} but candidate tower produces {}",
                query_tower.output_dimension(),
                candidate_tower.output_dimension()
            )));
        }
        Ok(Self {
            query_tower,
            candidate_tower,
            similarity,
        })
    }

    pub fn query_tower(&self) -> Arc<dyn Tower> {
        Arc::clone(&self.query_tower)
    }

    pub fn candidate_tower(&self) -> Arc<dyn Tower> {
        Arc::clone(&self.candidate_tower)
    }

    pub fn similarity(&self) -> Arc<dyn SimilarityScorer> {
        Arc::clone(&self.similarity)
    }

    pub fn embedding_size(&self) -> usize {
        self.candidate_tower.output_dimension()
    }

    /// Reload the schema of both towers.
    pub fn reload_schemas(&self) -> Result<()> {
        self.query_tower.reload_schema()?;
        self.candidate_tower.reload_schema()?;
        debug!("reloaded tower schemas");
        Ok(())
    }

    /// Score every row of `batch` as a (query, candidate) pair.
    pub async fn score(&self, batch: &Minibatch<'_>) -> Result<Vec<f32>> {
        let queries = self.query_tower.encode(batch).await?;
        let candidates = self.candidate_tower.encode(batch).await?;
        if queries.len() != batch.len() || candidates.len() != batch.len() {
            return Err(GlaiveError::model(format!(
                "towers returned {} and {} embeddings for {} rows",
                queries.len(),
                candidates.len(),
                batch.len()
            )));
        }
        queries
            .iter()
            .zip(&candidates)
            .map(|(query, candidate)| self.similarity.score(query, candidate))
            .collect()
    }
}

/// A tower whose embeddings were computed upstream and stored in a column.
#[derive(Debug, Clone)]
pub struct PrecomputedTower {
    column: String,
    dimension: usize,
}

impl PrecomputedTower {
    pub fn new<S: Into<String>>(column: S, dimension: usize) -> Self {
        Self {
            column: column.into(),
            dimension,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }
}

#[async_trait]
impl Tower for PrecomputedTower {
    fn output_dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, batch: &Minibatch<'_>) -> Result<Vec<Vector>> {
        batch
            .vectors(&self.column, self.dimension)
            .map_err(|err| GlaiveError::model(err.to_string()))
    }
}

/// Dot product of the two embeddings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductSimilarity;

impl SimilarityScorer for DotProductSimilarity {
    fn score(&self, query: &Vector, candidate: &Vector) -> Result<f32> {
        candidate.validate_dimension(query.dimension())?;
        Ok(dot_product(query.as_slice(), candidate.as_slice()))
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Final evaluation metric reported by the trainer, if any.
    pub final_metric: Option<f64>,
}

/// Runs training and writes the model artifact to `model_out_path`.
#[async_trait]
pub trait Trainer: Send + Sync + Debug {
    async fn train(&self, dataset: &Dataset, model_out_path: &str) -> Result<TrainingSummary>;
}

/// Loads a trained model artifact.
#[async_trait]
pub trait ModelLoader: Send + Sync + Debug {
    async fn load(&self, model_path: &str) -> Result<TwoTowerModel>;
}
