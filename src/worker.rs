//! Per-rank workers of the build and retrieval phases.
//!
//! Workers share nothing but storage names. Each one is started with an
//! explicit context, fed minibatches of its own partition, and stopped.

pub mod builder;
pub mod id_file;
pub mod retrieval;

pub use builder::{BuildContext, BuildReport, CandidateRecord, ShardBuildingWorker};
pub use id_file::{CandidateMetadata, IdFileFormat, IdFileReader, MetadataTable};
pub use retrieval::{RetrievalContext, RetrievalWorker, RowCountSummary, SearchRow};
