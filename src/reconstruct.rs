//! Turns per-query search output into metadata-joined recommendation lists.
//!
//! The steps mirror a relational plan over the search rows:
//!
//! 1. every query row carries a strictly increasing surrogate key,
//! 2. `(index, distance)` pairs are exploded with their ordinal `pos`,
//! 3. exploded hits are inner-joined with the candidate metadata table,
//! 4. hits are regrouped per key in `pos` order,
//! 5. the lists are joined back onto the query rows and the key is dropped.
//!
//! Hits without metadata disappear from their list. Query rows never
//! disappear: a row whose hits were all dropped gets an empty list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::dataset::{Dataset, Row, Value};
use crate::error::{GlaiveError, Result};
use crate::worker::id_file::MetadataTable;
use crate::worker::retrieval::SearchRow;

/// One recommended candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    /// Candidate metadata string from the id files.
    pub name: String,
    pub distance: f32,
}

/// Ordered recommendations of one query, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateList {
    entries: Vec<CandidateEntry>,
}

impl CandidateList {
    pub fn entries(&self) -> &[CandidateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }
}

impl FromIterator<CandidateEntry> for CandidateList {
    fn from_iter<I: IntoIterator<Item = CandidateEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// An exploded search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplodedHit {
    pub key: u64,
    /// Rank of the hit within its query, starting at 0.
    pub pos: usize,
    pub index: u64,
    pub distance: f32,
}

/// Explode search rows into one hit per `(key, pos)`.
pub fn explode(rows: &[SearchRow]) -> Vec<ExplodedHit> {
    rows.iter()
        .flat_map(|row| {
            row.indices
                .iter()
                .zip(&row.distances)
                .enumerate()
                .map(move |(pos, (index, distance))| ExplodedHit {
                    key: row.key,
                    pos,
                    index: *index,
                    distance: *distance,
                })
        })
        .collect()
}

/// A query row with its recommendations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationRow {
    /// The original query values, without the surrogate key.
    pub values: Row,
    pub candidates: CandidateList,
}

/// Query rows with their recommendation lists, in original order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationTable {
    columns: Vec<String>,
    list_column: String,
    rows: Vec<RecommendationRow>,
}

impl RecommendationTable {
    /// Query columns, without the list column.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Name of the recommendation list column.
    pub fn list_column(&self) -> &str {
        &self.list_column
    }

    pub fn rows(&self) -> &[RecommendationRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<RecommendationRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Joins search output back onto query rows.
#[derive(Debug, Clone)]
pub struct ResultReconstructor {
    key_column: String,
    list_column: String,
}

impl ResultReconstructor {
    pub fn new<K: Into<String>, L: Into<String>>(key_column: K, list_column: L) -> Self {
        Self {
            key_column: key_column.into(),
            list_column: list_column.into(),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(
            config.increasing_id_column_name.clone(),
            config.recommendation_info_column_name.clone(),
        )
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Add the surrogate key column: row `i` gets key `i`.
    pub fn assign_keys(&self, queries: &Dataset) -> Result<Dataset> {
        queries.with_column(&self.key_column, |i, _| Value::Int(i as i64))
    }

    /// Inner-join exploded hits with `metadata` and regroup them per key in
    /// `pos` order.
    pub fn regroup(
        &self,
        rows: &[SearchRow],
        metadata: &MetadataTable,
    ) -> BTreeMap<u64, CandidateList> {
        let mut grouped: BTreeMap<u64, Vec<(usize, CandidateEntry)>> = BTreeMap::new();
        let mut dropped = 0usize;

        for hit in explode(rows) {
            match metadata.get(hit.index) {
                Some(candidate) => grouped.entry(hit.key).or_default().push((
                    hit.pos,
                    CandidateEntry {
                        name: candidate.name.clone(),
                        distance: hit.distance,
                    },
                )),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "dropped hits without candidate metadata");
        }

        grouped
            .into_iter()
            .map(|(key, mut hits)| {
                hits.sort_by_key(|(pos, _)| *pos);
                (key, hits.into_iter().map(|(_, entry)| entry).collect())
            })
            .collect()
    }

    /// Attach lists to the keyed query rows, drop the key and restore the
    /// original row order.
    pub fn reconstruct(
        &self,
        keyed: &Dataset,
        rows: &[SearchRow],
        metadata: &MetadataTable,
    ) -> Result<RecommendationTable> {
        let key_index = keyed.column_index(&self.key_column)?;
        let mut lists = self.regroup(rows, metadata);

        let mut output = keyed
            .rows()
            .iter()
            .map(|row| {
                let key = row[key_index]
                    .as_i64()
                    .and_then(|key| u64::try_from(key).ok())
                    .ok_or_else(|| {
                        GlaiveError::invalid_argument(format!(
                            "surrogate key column {:?} holds {:?}",
                            self.key_column, row[key_index]
                        ))
                    })?;
                let mut values = row.clone();
                values.remove(key_index);
                Ok((key, values))
            })
            .collect::<Result<Vec<(u64, Row)>>>()?;
        output.sort_by_key(|(key, _)| *key);

        let mut columns = keyed.columns().to_vec();
        columns.remove(key_index);

        Ok(RecommendationTable {
            columns,
            list_column: self.list_column.clone(),
            rows: output
                .into_iter()
                .map(|(key, values)| RecommendationRow {
                    values,
                    candidates: lists.remove(&key).unwrap_or_default(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::id_file::CandidateMetadata;

    fn metadata(ids: &[(u64, &str)]) -> MetadataTable {
        let mut table = MetadataTable::new();
        for (id, name) in ids {
            table.insert(
                *id,
                CandidateMetadata {
                    name: name.to_string(),
                    embedding: None,
                },
            );
        }
        table
    }

    fn keyed_queries(names: &[&str]) -> Dataset {
        let mut dataset = Dataset::new(["user"]).unwrap();
        for name in names {
            dataset.push_row(vec![Value::from(*name)]).unwrap();
        }
        ResultReconstructor::new("iid", "rec_info")
            .assign_keys(&dataset)
            .unwrap()
    }

    fn row(key: u64, hits: &[(u64, f32)]) -> SearchRow {
        SearchRow {
            key,
            indices: hits.iter().map(|(id, _)| *id).collect(),
            distances: hits.iter().map(|(_, d)| *d).collect(),
        }
    }

    #[test]
    fn test_explode_positions() {
        let hits = explode(&[row(5, &[(9, 0.5), (3, 0.7)])]);
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[1].key, hits[1].pos, hits[1].index), (5, 1, 3));
    }

    #[test]
    fn test_rank_order_survives_ties() {
        let reconstructor = ResultReconstructor::new("iid", "rec_info");
        let keyed = keyed_queries(&["alice"]);
        let rows = [row(0, &[(7, 1.0), (2, 1.0), (5, 1.0)])];
        let table = reconstructor
            .reconstruct(&keyed, &rows, &metadata(&[(2, "b"), (5, "c"), (7, "a")]))
            .unwrap();

        assert_eq!(table.rows()[0].candidates.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_metadata_is_dropped() {
        let reconstructor = ResultReconstructor::new("iid", "rec_info");
        let keyed = keyed_queries(&["alice"]);
        let rows = [row(0, &[(0, 0.0), (3, 0.5), (1, 1.0)])];
        let table = reconstructor
            .reconstruct(&keyed, &rows, &metadata(&[(0, "zero"), (1, "one")]))
            .unwrap();

        let candidates = &table.rows()[0].candidates;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.names(), vec!["zero", "one"]);
        assert_eq!(candidates.entries()[1].distance, 1.0);
    }

    #[test]
    fn test_every_query_row_kept_in_order() {
        let reconstructor = ResultReconstructor::new("iid", "rec_info");
        let keyed = keyed_queries(&["alice", "bob", "carol"]);
        let rows = [
            row(2, &[(1, 0.1)]),
            row(0, &[(1, 0.2)]),
            row(1, &[(42, 0.3)]),
        ];
        let table = reconstructor
            .reconstruct(&keyed, &rows, &metadata(&[(1, "one")]))
            .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.columns(), &["user"]);
        assert_eq!(table.list_column(), "rec_info");
        let users: Vec<&Value> = table.rows().iter().map(|r| &r.values[0]).collect();
        assert_eq!(
            users,
            vec![&Value::from("alice"), &Value::from("bob"), &Value::from("carol")]
        );
        assert!(table.rows()[1].candidates.is_empty());
        assert_eq!(table.rows()[2].candidates.entries()[0].distance, 0.1);
    }

    #[test]
    fn test_list_length_never_exceeds_hits() {
        let reconstructor = ResultReconstructor::new("iid", "rec_info");
        let keyed = keyed_queries(&["a", "b"]);
        let rows = [
            row(0, &[(1, 0.0), (2, 0.1), (3, 0.2)]),
            row(1, &[(3, 0.0)]),
        ];
        let table = reconstructor
            .reconstruct(&keyed, &rows, &metadata(&[(1, "x"), (2, "y"), (3, "z")]))
            .unwrap();
        for (output, input) in table.rows().iter().zip(&rows) {
            assert_eq!(output.candidates.len(), input.len());
        }
    }

    #[test]
    fn test_existing_key_column_rejected() {
        let reconstructor = ResultReconstructor::new("iid", "rec_info");
        let keyed = keyed_queries(&["a"]);
        assert!(reconstructor.assign_keys(&keyed).is_err());
    }
}
