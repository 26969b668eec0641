//! Logical union of index shards with global top-k merging.
//!
//! Every shard is searched for the full `k`, then the per-shard lists are
//! merged with a k-way heap. Ordering is `(distance, shard ordinal, insertion
//! position)`, so when shards are contiguous partitions of the candidate list
//! the result equals a search over one unsharded index.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::error::{GlaiveError, Result};
use crate::vector::core::distance::DistanceMetric;
use crate::vector::core::vector::Vector;
use crate::vector::index::flat::{FlatIndex, Hit};
use crate::vector::index::{AnnIndex, Neighbors};

/// Head of one shard's sorted hit list inside the merge heap.
#[derive(Debug, Clone, Copy)]
struct HeapHit {
    hit: Hit,
    shard: usize,
    offset: usize,
}

impl HeapHit {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.hit
            .distance
            .total_cmp(&other.hit.distance)
            .then_with(|| self.shard.cmp(&other.shard))
            .then_with(|| self.hit.position.cmp(&other.hit.position))
    }
}

impl PartialEq for HeapHit {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapHit {}

impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the best hit is on top of the max-heap.
        other.rank_cmp(self)
    }
}

/// Merge per-shard sorted hit lists into the global top `k`.
pub fn merge_shard_hits(per_shard: &[Vec<Hit>], k: usize) -> Neighbors {
    let mut heap = BinaryHeap::with_capacity(per_shard.len());
    for (shard, hits) in per_shard.iter().enumerate() {
        if let Some(hit) = hits.first() {
            heap.push(HeapHit {
                hit: *hit,
                shard,
                offset: 0,
            });
        }
    }

    let mut merged = Neighbors::default();
    while merged.len() < k {
        let Some(head) = heap.pop() else {
            break;
        };
        merged.ids.push(head.hit.id);
        merged.distances.push(head.hit.distance);

        let next = head.offset + 1;
        if let Some(hit) = per_shard[head.shard].get(next) {
            heap.push(HeapHit {
                hit: *hit,
                shard: head.shard,
                offset: next,
            });
        }
    }
    merged
}

/// Index made of independently built shards, searched as one.
#[derive(Debug, Clone)]
pub struct ShardedIndex {
    dimension: usize,
    metric: DistanceMetric,
    shards: Vec<FlatIndex>,
}

impl ShardedIndex {
    /// Create an index without shards.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            shards: Vec::new(),
        }
    }

    /// Register the next shard. Its ordinal is the number of shards added
    /// before it.
    pub fn add_shard(&mut self, shard: FlatIndex) -> Result<()> {
        if shard.dimension() != self.dimension {
            return Err(GlaiveError::InvalidOperation(format!(
                "Shard {} has dimension {}, expected {}",
                self.shards.len(),
                shard.dimension(),
                self.dimension
            )));
        }
        if shard.metric() != self.metric {
            return Err(GlaiveError::InvalidOperation(format!(
                "Shard {} uses metric {}, expected {}",
                self.shards.len(),
                shard.metric().name(),
                self.metric.name()
            )));
        }
        self.shards.push(shard);
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Candidates held by each shard, in ordinal order.
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.ntotal()).collect()
    }
}

impl AnnIndex for ShardedIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ntotal(&self) -> usize {
        self.shards.iter().map(|shard| shard.ntotal()).sum()
    }

    fn search(&self, queries: &[Vector], k: usize) -> Result<Vec<Neighbors>> {
        for query in queries {
            query.validate_dimension(self.dimension)?;
        }

        // per_shard[shard][query]
        let per_shard: Vec<Vec<Vec<Hit>>> = self
            .shards
            .par_iter()
            .map(|shard| {
                queries
                    .iter()
                    .map(|query| shard.search_hits(query.as_slice(), k))
                    .collect()
            })
            .collect();

        let results = (0..queries.len())
            .into_par_iter()
            .map(|query| {
                let lists: Vec<Vec<Hit>> = per_shard
                    .iter()
                    .map(|shard_hits| shard_hits[query].clone())
                    .collect();
                merge_shard_hits(&lists, k)
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(points: &[[f32; 2]], ids: &[u64]) -> FlatIndex {
        let mut index = FlatIndex::new(2, DistanceMetric::L2);
        let vectors: Vec<Vector> = points.iter().map(|p| Vector::new(p.to_vec())).collect();
        index.add_with_ids(&vectors, ids).unwrap();
        index
    }

    #[test]
    fn test_two_shard_scenario() {
        let mut index = ShardedIndex::new(2, DistanceMetric::L2);
        index.add_shard(shard(&[[0.0, 0.0], [1.0, 0.0]], &[0, 1])).unwrap();
        index.add_shard(shard(&[[0.0, 1.0], [5.0, 5.0]], &[2, 3])).unwrap();

        let results = index.search(&[Vector::new(vec![0.0, 0.0])], 2).unwrap();
        assert_eq!(results[0].ids, vec![0, 1]);
        assert_eq!(results[0].distances, vec![0.0, 1.0]);
        assert_eq!(index.ntotal(), 4);
    }

    #[test]
    fn test_matches_unsharded_search() {
        let points: Vec<[f32; 2]> = (0..40)
            .map(|i| {
                let x = (i % 7) as f32;
                let y = (i / 7) as f32 * 0.5;
                [x, y]
            })
            .collect();
        let ids: Vec<u64> = (0..40).map(|i| 1000 + i as u64).collect();

        let whole = shard(&points, &ids);

        let mut sharded = ShardedIndex::new(2, DistanceMetric::L2);
        for (chunk_points, chunk_ids) in points.chunks(11).zip(ids.chunks(11)) {
            sharded.add_shard(shard(chunk_points, chunk_ids)).unwrap();
        }
        assert_eq!(sharded.shard_count(), 4);

        let queries: Vec<Vector> = [[0.0, 0.0], [3.0, 1.0], [6.5, 2.5], [2.0, 2.0], [10.0, -3.0]]
            .iter()
            .map(|q| Vector::new(q.to_vec()))
            .collect();

        for k in [1, 3, 8, 40] {
            assert_eq!(
                sharded.search(&queries, k).unwrap(),
                whole.search(&queries, k).unwrap(),
                "k = {k}"
            );
        }
    }

    #[test]
    fn test_each_candidate_returned_once() {
        let mut index = ShardedIndex::new(2, DistanceMetric::L2);
        index.add_shard(shard(&[[1.0, 1.0]], &[1])).unwrap();
        index.add_shard(shard(&[[2.0, 2.0]], &[2])).unwrap();
        index.add_shard(shard(&[], &[])).unwrap();

        let results = index.search(&[Vector::new(vec![0.0, 0.0])], 10).unwrap();
        assert_eq!(results[0].ids, vec![1, 2]);
    }

    #[test]
    fn test_rejects_mismatched_shard() {
        let mut index = ShardedIndex::new(3, DistanceMetric::L2);
        assert!(index.add_shard(shard(&[[1.0, 1.0]], &[1])).is_err());

        let mut index = ShardedIndex::new(2, DistanceMetric::InnerProduct);
        assert!(index.add_shard(shard(&[[1.0, 1.0]], &[1])).is_err());
        assert_eq!(index.shard_count(), 0);
    }

    #[test]
    fn test_merge_breaks_ties_by_shard_ordinal() {
        let a = vec![Hit {
            id: 9,
            distance: 1.0,
            position: 3,
        }];
        let b = vec![Hit {
            id: 4,
            distance: 1.0,
            position: 0,
        }];
        let merged = merge_shard_hits(&[a, b], 2);
        assert_eq!(merged.ids, vec![9, 4]);
    }
}
