//! In-process columnar dataset with explicit partitioning.
//!
//! A [`Dataset`] is a named set of columns over row-major [`Value`]s. Workers
//! receive one contiguous partition each (see [`partition_range`]) and walk it
//! in [`Minibatch`]es.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{GlaiveError, Result};
use crate::vector::core::vector::Vector;

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Vector(Vec<f32>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
            Value::Vector(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<f32>> for Value {
    fn from(values: Vec<f32>) -> Self {
        Value::Vector(values)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One row of a dataset.
pub type Row = Vec<Value>;

/// Rows `[start, end)` owned by `rank` out of `worker_count` workers.
///
/// Partitions are contiguous and their sizes differ by at most one.
pub fn partition_range(len: usize, worker_count: usize, rank: usize) -> Range<usize> {
    if worker_count == 0 || rank >= worker_count {
        return len..len;
    }
    let start = rank * len / worker_count;
    let end = (rank + 1) * len / worker_count;
    start..end
}

/// Named columns over row-major values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Dataset {
    /// Create an empty dataset with the given column names.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Result<Self> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].contains(name) {
                return Err(GlaiveError::invalid_argument(format!(
                    "duplicate column name {name:?}"
                )));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Append a row. Its arity must match the column count.
    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(GlaiveError::invalid_argument(format!(
                "row has {} values but dataset has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of column `name`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        column_position(&self.columns, name)
    }

    /// Copy of this dataset with a new trailing column computed per row.
    pub fn with_column<F>(&self, name: &str, mut value: F) -> Result<Self>
    where
        F: FnMut(usize, &Row) -> Value,
    {
        if self.columns.iter().any(|column| column == name) {
            return Err(GlaiveError::invalid_argument(format!(
                "column {name:?} already exists"
            )));
        }

        let mut columns = self.columns.clone();
        columns.push(name.to_string());
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut row = row.clone();
                let extra = value(i, &row);
                row.push(extra);
                row
            })
            .collect();
        Ok(Self { columns, rows })
    }

    /// The contiguous partition owned by `rank`.
    pub fn partition(&self, worker_count: usize, rank: usize) -> Result<Self> {
        if worker_count == 0 || rank >= worker_count {
            return Err(GlaiveError::invalid_argument(format!(
                "rank {rank} out of range for worker_count {worker_count}"
            )));
        }
        let range = partition_range(self.rows.len(), worker_count, rank);
        Ok(Self {
            columns: self.columns.clone(),
            rows: self.rows[range].to_vec(),
        })
    }

    /// Minibatches of at most `size` rows, in row order.
    pub fn minibatches(&self, size: usize) -> impl Iterator<Item = Minibatch<'_>> + '_ {
        self.rows.chunks(size.max(1)).map(|rows| Minibatch {
            columns: &self.columns,
            rows,
        })
    }

    /// The whole dataset as one minibatch.
    pub fn as_minibatch(&self) -> Minibatch<'_> {
        Minibatch {
            columns: &self.columns,
            rows: &self.rows,
        }
    }
}

fn column_position(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|column| column == name)
        .ok_or_else(|| GlaiveError::invalid_argument(format!("unknown column {name:?}")))
}

/// A borrowed slice of rows sharing their dataset's columns.
#[derive(Debug, Clone, Copy)]
pub struct Minibatch<'a> {
    columns: &'a [String],
    rows: &'a [Row],
}

impl<'a> Minibatch<'a> {
    pub fn columns(&self) -> &'a [String] {
        self.columns
    }

    pub fn rows(&self) -> &'a [Row] {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        column_position(self.columns, name)
    }

    /// Iterate over one column by position.
    pub fn column(&self, index: usize) -> Result<impl Iterator<Item = &'a Value> + 'a> {
        if index >= self.columns.len() {
            return Err(GlaiveError::invalid_argument(format!(
                "column index {index} out of range for {} columns",
                self.columns.len()
            )));
        }
        Ok(self.rows.iter().map(move |row| &row[index]))
    }

    /// Read column `name` as non-negative integer ids.
    pub fn ids(&self, name: &str) -> Result<Vec<u64>> {
        let index = self.column_index(name)?;
        self.column(index)?
            .map(|value| {
                value
                    .as_i64()
                    .and_then(|id| u64::try_from(id).ok())
                    .ok_or_else(|| {
                        GlaiveError::invalid_argument(format!(
                            "column {name:?} holds {value:?}, expected a non-negative integer id"
                        ))
                    })
            })
            .collect()
    }

    /// Read column `name` as embeddings of `dimension` components.
    pub fn vectors(&self, name: &str, dimension: usize) -> Result<Vec<Vector>> {
        let index = self.column_index(name)?;
        self.column(index)?
            .map(|value| {
                let vector = Vector::new(
                    value
                        .as_vector()
                        .ok_or_else(|| {
                            GlaiveError::invalid_argument(format!(
                                "column {name:?} holds {value:?}, expected an embedding"
                            ))
                        })?
                        .to_vec(),
                );
                vector.validate_dimension(dimension)?;
                Ok(vector)
            })
            .collect()
    }
}
