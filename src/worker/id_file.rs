//! Id files: one text line per candidate, written next to each index shard.
//!
//! ```text
//! <candidate_id> F <meta_1> V <meta_2> ... [F <emb_0> V <emb_1> ...]\n
//! ```
//!
//! `F` and `V` are the configured field and value delimiters.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader};

use ahash::AHashMap;
use tracing::{info, warn};

use crate::config::RetrievalConfig;
use crate::error::{GlaiveError, Result};
use crate::storage::Storage;
use crate::vector::core::vector::Vector;
use crate::vector::index::manifest::ShardManifest;

/// Delimiters and options of the id-file text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFileFormat {
    pub field_delimiter: char,
    pub value_delimiter: char,
    pub output_embeddings: bool,
}

impl Default for IdFileFormat {
    fn default() -> Self {
        Self {
            field_delimiter: '\u{2}',
            value_delimiter: '\u{1}',
            output_embeddings: false,
        }
    }
}

impl From<&RetrievalConfig> for IdFileFormat {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            field_delimiter: config.item_ids_field_delimiter,
            value_delimiter: config.item_ids_value_delimiter,
            output_embeddings: config.output_item_embeddings,
        }
    }
}

impl IdFileFormat {
    /// Append one record line to `out`. `None` metadata is written empty.
    pub fn write_line(
        &self,
        out: &mut String,
        candidate_id: u64,
        metadata: &[Option<String>],
        embedding: &Vector,
    ) {
        let _ = write!(out, "{candidate_id}");
        out.push(self.field_delimiter);
        for (i, value) in metadata.iter().enumerate() {
            if i > 0 {
                out.push(self.value_delimiter);
            }
            if let Some(value) = value {
                out.push_str(value);
            }
        }
        if self.output_embeddings {
            out.push(self.field_delimiter);
            for (i, component) in embedding.as_slice().iter().enumerate() {
                if i > 0 {
                    out.push(self.value_delimiter);
                }
                let _ = write!(out, "{component}");
            }
        }
        out.push('\n');
    }

    /// Parse one line (without its terminator).
    ///
    /// Column 0 is the id, column 1 the metadata string, and column 2, when
    /// present and non-empty, the embedding.
    pub fn parse_line(&self, line: &str) -> std::result::Result<(u64, CandidateMetadata), String> {
        let mut fields = line.split(self.field_delimiter);
        let id_field = fields.next().unwrap_or_default();
        let id = id_field
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid candidate id {id_field:?}"))?;
        let name = fields.next().unwrap_or_default().to_string();

        let embedding = match fields.next() {
            Some(raw) if !raw.is_empty() => Some(Vector::new(
                raw.split(self.value_delimiter)
                    .map(|component| {
                        component
                            .parse::<f32>()
                            .map_err(|_| format!("invalid embedding component {component:?}"))
                    })
                    .collect::<std::result::Result<Vec<f32>, String>>()?,
            )),
            _ => None,
        };

        Ok((id, CandidateMetadata { name, embedding }))
    }
}

/// Metadata attached to a candidate id.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMetadata {
    /// The metadata fields joined by the value delimiter.
    pub name: String,
    pub embedding: Option<Vector>,
}

/// Candidate metadata keyed by candidate id.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    entries: AHashMap<u64, CandidateMetadata>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. The first entry of an id wins; returns whether this
    /// one was kept.
    pub fn insert(&mut self, id: u64, metadata: CandidateMetadata) -> bool {
        match self.entries.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(metadata);
                true
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&CandidateMetadata> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads the id files of every shard of a manifest.
#[derive(Debug, Clone)]
pub struct IdFileReader {
    manifest: ShardManifest,
    format: IdFileFormat,
}

impl IdFileReader {
    pub fn new(manifest: ShardManifest, format: IdFileFormat) -> Self {
        Self { manifest, format }
    }

    /// Read every declared id file into one table.
    pub fn read(&self, storage: &dyn Storage) -> Result<MetadataTable> {
        let mut table = MetadataTable::new();
        let mut duplicates = 0usize;

        for shard in self.manifest.shards() {
            let name = shard.ids_path();
            let reader = BufReader::new(storage.open_input(&name)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if line.is_empty() {
                    continue;
                }
                let (id, metadata) = self.format.parse_line(line).map_err(|reason| {
                    GlaiveError::storage(format!("{name}:{}: {reason}", number + 1))
                })?;
                if !table.insert(id, metadata) {
                    duplicates += 1;
                }
            }
        }

        if duplicates > 0 {
            warn!(duplicates, "ignored duplicate candidate ids in id files");
        }
        info!(
            worker_count = self.manifest.worker_count(),
            candidates = table.len(),
            "loaded candidate metadata"
        );
        Ok(table)
    }
}
