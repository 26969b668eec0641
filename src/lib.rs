//! # Glaive
//!
//! Sharded nearest-neighbor index lifecycle for two-tower retrieval models.
//!
//! ## Features
//!
//! - One exact L2 index shard per build worker, persisted with a checksummed
//!   binary format
//! - Manifest-checked assembly of every shard into one searchable index with
//!   global top-k merging
//! - Partitioned retrieval workers with explicit per-call contexts
//! - Rank-preserving reconstruction of metadata-joined recommendation lists
//! - Pluggable storage backends and recursive export to local or S3 paths
//!
//! Training, model serialization and the encoders themselves are external
//! collaborators behind the traits in [`model`].

pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod reconstruct;
pub mod storage;
pub mod vector;
pub mod worker;

pub mod prelude {
    pub use crate::config::{PathLayout, RetrievalConfig};
    pub use crate::dataset::{Dataset, Minibatch, Value};
    pub use crate::error::{GlaiveError, Result};
    pub use crate::model::{
        DotProductSimilarity, ModelLoader, PrecomputedTower, SimilarityScorer, Tower, Trainer,
        TrainingSummary, TwoTowerModel,
    };
    pub use crate::orchestrator::{ServingSession, TrainingPipeline, build_index};
    pub use crate::reconstruct::{CandidateList, RecommendationTable, ResultReconstructor};
    pub use crate::storage::{SharedStorage, Storage};
    pub use crate::vector::index::AnnIndex;
    pub use crate::vector::{DistanceMetric, Vector};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
