//! Nearest-neighbor index shards and their assembly.
//!
//! - `flat`: exact L2 index with explicit candidate ids (one per build worker)
//! - `io`: binary shard codec
//! - `manifest`: shard naming convention and completeness checks
//! - `sharded`: logical union of shards with global top-k merging
//! - `assembler`: loads every shard of a manifest into a [`sharded::ShardedIndex`]

pub mod assembler;
pub mod flat;
pub mod io;
pub mod manifest;
pub mod sharded;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::vector::core::vector::Vector;

/// Top-k result of one query: candidate ids and distances, ascending by
/// distance, both of the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Neighbors {
    pub ids: Vec<u64>,
    pub distances: Vec<f32>,
}

impl Neighbors {
    /// Number of returned candidates.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no candidate was returned.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate over `(id, distance)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, f32)> + '_ {
        self.ids.iter().copied().zip(self.distances.iter().copied())
    }
}

/// A searchable nearest-neighbor index.
///
/// Implementations are immutable once built and may be shared across threads.
pub trait AnnIndex: Send + Sync + std::fmt::Debug {
    /// Dimension of the indexed vectors.
    fn dimension(&self) -> usize;

    /// Total number of indexed vectors.
    fn ntotal(&self) -> usize;

    /// Search the `k` nearest candidates of every query.
    ///
    /// Returns one [`Neighbors`] per query, in query order. Lists are shorter
    /// than `k` only when the index holds fewer than `k` vectors.
    fn search(&self, queries: &[Vector], k: usize) -> Result<Vec<Neighbors>>;
}
