//! Core vector data structure.

use serde::{Deserialize, Serialize};

use crate::error::{GlaiveError, Result};

/// A dense embedding produced by one tower of a two-tower model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    /// The vector components.
    pub data: Vec<f32>,
}

impl Vector {
    /// Create a new vector with the given components.
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Get the dimensionality of this vector.
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Borrow the components.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Calculate the L2 norm (magnitude) of this vector.
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Validate that this vector has the expected dimension.
    pub fn validate_dimension(&self, expected_dim: usize) -> Result<()> {
        if self.data.len() != expected_dim {
            return Err(GlaiveError::InvalidOperation(format!(
                "Vector dimension mismatch: expected {}, got {}",
                expected_dim,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Check if this vector contains any NaN or infinite values.
    pub fn is_valid(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Vector::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_validation() {
        let vector = Vector::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(vector.dimension(), 3);
        assert!(vector.validate_dimension(3).is_ok());
        assert!(vector.validate_dimension(4).is_err());
    }

    #[test]
    fn test_validity() {
        assert!(Vector::new(vec![0.0, 1.0]).is_valid());
        assert!(!Vector::new(vec![f32::NAN, 1.0]).is_valid());
        assert!(!Vector::new(vec![f32::INFINITY]).is_valid());
    }

    #[test]
    fn test_norm() {
        assert_eq!(Vector::from(vec![3.0, 4.0]).norm(), 5.0);
    }
}
