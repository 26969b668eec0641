//! Embedding vectors and distance computation.
//!
//! # Module Structure
//!
//! - `core`: Core data structures (vector, distance)
//! - `index`: Flat shards, the shard codec and sharded search

pub mod core;
pub mod index;

pub use self::core::distance::DistanceMetric;
pub use self::core::vector::Vector;
