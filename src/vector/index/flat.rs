//! Flat (exact) index with explicit candidate ids.
//!
//! Each build worker owns one `FlatIndex`. Vectors are stored contiguously and
//! searched by brute force; ties on distance are broken by insertion order so
//! that results are reproducible across rebuilds.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::error::{GlaiveError, Result};
use crate::vector::core::distance::DistanceMetric;
use crate::vector::core::vector::Vector;
use crate::vector::index::{AnnIndex, Neighbors};

/// Queries per batch above which search fans out over rayon.
const PARALLEL_QUERY_THRESHOLD: usize = 4;

/// One search hit with the insertion position that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub id: u64,
    pub distance: f32,
    pub position: usize,
}

impl Hit {
    /// Ascending by distance, then by insertion position.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.position.cmp(&other.position))
    }
}

/// Max-heap wrapper so the worst retained hit sits on top.
struct WorstFirst(Hit);

impl PartialEq for WorstFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WorstFirst {}

impl PartialOrd for WorstFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorstFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank_cmp(&other.0)
    }
}

/// Exact nearest-neighbor index over `(candidate_id, embedding)` pairs.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    ids: Vec<u64>,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Rebuild an index from decoded parts.
    pub(crate) fn from_parts(
        dimension: usize,
        metric: DistanceMetric,
        ids: Vec<u64>,
        data: Vec<f32>,
    ) -> Result<Self> {
        if data.len() != ids.len() * dimension {
            return Err(GlaiveError::InvalidOperation(format!(
                "{} ids do not match {} components of dimension {}",
                ids.len(),
                data.len(),
                dimension
            )));
        }
        Ok(Self {
            dimension,
            metric,
            ids,
            data,
        })
    }

    /// Distance metric of this index.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Candidate ids in insertion order.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Raw row-major vector storage.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Embedding stored at insertion position `position`.
    pub fn vector_at(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Add embeddings under explicit candidate ids.
    pub fn add_with_ids(&mut self, vectors: &[Vector], ids: &[u64]) -> Result<()> {
        if vectors.len() != ids.len() {
            return Err(GlaiveError::invalid_argument(format!(
                "{} vectors but {} ids",
                vectors.len(),
                ids.len()
            )));
        }

        for (vector, id) in vectors.iter().zip(ids) {
            vector.validate_dimension(self.dimension)?;
            if !vector.is_valid() {
                return Err(GlaiveError::InvalidOperation(format!(
                    "Vector {id} contains invalid values (NaN or infinity)"
                )));
            }
        }

        self.ids.extend_from_slice(ids);
        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector.as_slice());
        }
        Ok(())
    }

    /// Top-k hits of a single query, ascending by `(distance, position)`.
    pub fn search_hits(&self, query: &[f32], k: usize) -> Vec<Hit> {
        if k == 0 || self.ids.is_empty() || self.dimension == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<WorstFirst> = BinaryHeap::with_capacity(k + 1);
        for (position, (id, vector)) in self
            .ids
            .iter()
            .zip(self.data.chunks_exact(self.dimension))
            .enumerate()
        {
            let hit = Hit {
                id: *id,
                distance: self.metric.distance_unchecked(query, vector),
                position,
            };

            if heap.len() < k {
                heap.push(WorstFirst(hit));
            } else if let Some(worst) = heap.peek()
                && hit.rank_cmp(&worst.0) == Ordering::Less
            {
                heap.pop();
                heap.push(WorstFirst(hit));
            }
        }

        let mut hits: Vec<Hit> = heap.into_iter().map(|entry| entry.0).collect();
        hits.sort_by(Hit::rank_cmp);
        hits
    }

    /// Top-k hits for a batch of queries.
    pub fn search_batch_hits(&self, queries: &[Vector], k: usize) -> Result<Vec<Vec<Hit>>> {
        for query in queries {
            query.validate_dimension(self.dimension)?;
        }

        let hits = if queries.len() >= PARALLEL_QUERY_THRESHOLD {
            queries
                .par_iter()
                .map(|query| self.search_hits(query.as_slice(), k))
                .collect()
        } else {
            queries
                .iter()
                .map(|query| self.search_hits(query.as_slice(), k))
                .collect()
        };
        Ok(hits)
    }
}

impl AnnIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn search(&self, queries: &[Vector], k: usize) -> Result<Vec<Neighbors>> {
        Ok(self
            .search_batch_hits(queries, k)?
            .into_iter()
            .map(|hits| Neighbors {
                ids: hits.iter().map(|hit| hit.id).collect(),
                distances: hits.iter().map(|hit| hit.distance).collect(),
            })
            .collect())
    }
}
