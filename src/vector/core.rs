//! Core data structures for vector search.
//!
//! This module contains the embedding vector representation and the distance
//! metrics shared by index shards and query encoders.

pub mod distance;
pub mod vector;
