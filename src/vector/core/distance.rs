//! Distance metrics for nearest-neighbor search.
//!
//! Distances are always "smaller is closer" so that shard results can be
//! merged with a single ascending order regardless of metric.

use serde::{Deserialize, Serialize};
use wide::f32x8;

use crate::error::{GlaiveError, Result};

/// Distance metrics supported by index shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    /// Squared Euclidean distance, as reported by flat L2 indexes.
    #[default]
    L2,
    /// Negated inner product.
    InnerProduct,
}

impl DistanceMetric {
    /// Calculate the distance between two vectors using this metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(GlaiveError::InvalidOperation(format!(
                "Vector dimensions must match for distance calculation: {} vs {}",
                a.len(),
                b.len()
            )));
        }

        Ok(self.distance_unchecked(a, b))
    }

    /// Distance without the dimension check; callers guarantee equal lengths.
    #[inline]
    pub fn distance_unchecked(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => l2_squared(a, b),
            DistanceMetric::InnerProduct => -dot_product(a, b),
        }
    }

    /// Get the name of this distance metric.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }

    /// Parse a distance metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "inner_product" | "ip" | "dot" => Ok(DistanceMetric::InnerProduct),
            _ => Err(GlaiveError::InvalidOperation(format!(
                "Unknown distance metric: {s}"
            ))),
        }
    }

    /// Stable on-disk code of this metric.
    pub fn code(&self) -> u8 {
        match self {
            DistanceMetric::L2 => 1,
            DistanceMetric::InnerProduct => 2,
        }
    }

    /// Decode an on-disk metric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DistanceMetric::L2),
            2 => Some(DistanceMetric::InnerProduct),
            _ => None,
        }
    }
}

#[inline]
fn load(chunk: &[f32]) -> f32x8 {
    let mut lanes = [0.0f32; 8];
    lanes.copy_from_slice(chunk);
    f32x8::new(lanes)
}

/// SIMD squared Euclidean distance.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() < 8 {
        return a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    }

    let mut acc = f32x8::splat(0.0);
    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    for (chunk_a, chunk_b) in chunks_a.zip(chunks_b) {
        let diff = load(chunk_a) - load(chunk_b);
        acc = acc + diff * diff;
    }

    let mut total = acc.to_array().iter().sum::<f32>();
    total += remainder_a
        .iter()
        .zip(remainder_b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>();
    total
}

/// SIMD dot product.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() < 8 {
        return a.iter().zip(b).map(|(x, y)| x * y).sum();
    }

    let mut acc = f32x8::splat(0.0);
    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    for (chunk_a, chunk_b) in chunks_a.zip(chunks_b) {
        acc = acc + load(chunk_a) * load(chunk_b);
    }

    acc.to_array().iter().sum::<f32>()
        + remainder_a
            .iter()
            .zip(remainder_b)
            .map(|(x, y)| x * y)
            .sum::<f32>()
}
