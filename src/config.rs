//! Configuration for index building and retrieval.
//!
//! Every option is validated eagerly: [`RetrievalConfig::validate`] runs
//! before any worker starts, and [`RetrievalConfig::from_json_value`] checks
//! raw JSON field by field so a wrong type names the field and the value.
//!
//! # Examples
//!
//! ```
//! use glaive::config::RetrievalConfig;
//!
//! let config = RetrievalConfig::builder(16)
//!     .item_ids_column_indices(vec![1, 2])
//!     .retrieval_item_count(20)
//!     .worker_count(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.item_id_column_name, "item_id");
//! assert_eq!(config.item_ids_field_delimiter, '\u{2}');
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{GlaiveError, Result};
use crate::storage::url::{ObjectUrl, is_object_store_url, use_s3};
use crate::vector::index::manifest::{FAISS_DIR, ShardId, ShardManifest};

/// Options shared by the build, retrieval and reconstruction phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Dimension of candidate (and query) embeddings. Has no usable default.
    pub item_embedding_size: usize,
    /// Candidate dataset column holding the candidate id.
    pub item_id_column_name: String,
    /// Candidate dataset columns written as metadata to the id files.
    pub item_ids_column_indices: Vec<usize>,
    /// Separates the id, metadata and embedding sections of an id-file line.
    pub item_ids_field_delimiter: char,
    /// Separates values inside one section.
    pub item_ids_value_delimiter: char,
    /// Append candidate embeddings to id-file lines.
    pub output_item_embeddings: bool,
    /// Surrogate key column added to query rows during retrieval.
    pub increasing_id_column_name: String,
    /// Output column holding the recommendation list.
    pub recommendation_info_column_name: String,
    /// Number of candidates retrieved per query.
    pub retrieval_item_count: usize,
    /// Number of build (and retrieval) workers.
    pub worker_count: usize,
    /// Rows per minibatch fed to a tower.
    pub minibatch_size: usize,
    /// Model artifact read by the build and serving phases.
    pub model_in_path: Option<String>,
    /// Where training writes the model artifact.
    pub model_out_path: Option<String>,
    /// Root of the final export; no export when unset.
    pub model_export_path: Option<String>,
    /// Name of the exported model directory.
    pub experiment_name: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            item_embedding_size: 0,
            item_id_column_name: "item_id".to_string(),
            item_ids_column_indices: Vec::new(),
            item_ids_field_delimiter: '\u{2}',
            item_ids_value_delimiter: '\u{1}',
            output_item_embeddings: false,
            increasing_id_column_name: "iid".to_string(),
            recommendation_info_column_name: "rec_info".to_string(),
            retrieval_item_count: 10,
            worker_count: 1,
            minibatch_size: 1024,
            model_in_path: None,
            model_out_path: None,
            model_export_path: None,
            experiment_name: None,
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GlaiveError::config(
            field,
            "\"\"",
            "must be a non-empty string",
        ));
    }
    Ok(())
}

fn positive(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(GlaiveError::config(
            field,
            "0",
            "must be a positive integer",
        ));
    }
    Ok(())
}

impl RetrievalConfig {
    /// Start a builder for a model producing `item_embedding_size`-dimension
    /// embeddings.
    pub fn builder(item_embedding_size: usize) -> RetrievalConfigBuilder {
        RetrievalConfigBuilder::new(item_embedding_size)
    }

    /// Check every option's range.
    pub fn validate(&self) -> Result<()> {
        positive("item_embedding_size", self.item_embedding_size)?;
        non_empty("item_id_column_name", &self.item_id_column_name)?;
        if self.item_ids_field_delimiter == self.item_ids_value_delimiter {
            return Err(GlaiveError::config(
                "item_ids_value_delimiter",
                format!("{:?}", self.item_ids_value_delimiter),
                "must differ from item_ids_field_delimiter",
            ));
        }
        for (field, delimiter) in [
            ("item_ids_field_delimiter", self.item_ids_field_delimiter),
            ("item_ids_value_delimiter", self.item_ids_value_delimiter),
        ] {
            if delimiter == '\n' || delimiter == '\r' {
                return Err(GlaiveError::config(
                    field,
                    format!("{delimiter:?}"),
                    "must not be a line terminator",
                ));
            }
        }
        non_empty("increasing_id_column_name", &self.increasing_id_column_name)?;
        non_empty(
            "recommendation_info_column_name",
            &self.recommendation_info_column_name,
        )?;
        positive("retrieval_item_count", self.retrieval_item_count)?;
        positive("worker_count", self.worker_count)?;
        positive("minibatch_size", self.minibatch_size)?;
        if self.model_export_path.is_some() && self.experiment_name.is_none() {
            return Err(GlaiveError::config(
                "experiment_name",
                "null",
                "is required when model_export_path is set",
            ));
        }
        for (field, path) in [
            ("model_in_path", &self.model_in_path),
            ("model_out_path", &self.model_out_path),
            ("model_export_path", &self.model_export_path),
        ] {
            if let Some(path) = path
                && is_object_store_url(path)
            {
                ObjectUrl::parse_dir(path).map_err(|_| {
                    GlaiveError::config(field, format!("{path:?}"), "must be s3://<bucket>/<key>")
                })?;
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON object of options.
    ///
    /// Unknown keys are rejected. Missing keys take their default.
    pub fn from_json_value(value: &JsonValue) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            GlaiveError::config("<root>", value.to_string(), "must be a JSON object")
        })?;

        let mut config = RetrievalConfig::default();
        for (key, raw) in object {
            let field = key.as_str();
            match field {
                "item_embedding_size" => config.item_embedding_size = json_positive(field, raw)?,
                "item_id_column_name" => config.item_id_column_name = json_string(field, raw)?,
                "item_ids_column_indices" => {
                    config.item_ids_column_indices = json_indices(field, raw)?
                }
                "item_ids_field_delimiter" => {
                    config.item_ids_field_delimiter = json_delimiter(field, raw)?
                }
                "item_ids_value_delimiter" => {
                    config.item_ids_value_delimiter = json_delimiter(field, raw)?
                }
                "output_item_embeddings" => {
                    config.output_item_embeddings = raw.as_bool().ok_or_else(|| {
                        GlaiveError::config(field, raw.to_string(), "must be a boolean")
                    })?
                }
                "increasing_id_column_name" => {
                    config.increasing_id_column_name = json_string(field, raw)?
                }
                "recommendation_info_column_name" => {
                    config.recommendation_info_column_name = json_string(field, raw)?
                }
                "retrieval_item_count" => config.retrieval_item_count = json_positive(field, raw)?,
                "worker_count" => config.worker_count = json_positive(field, raw)?,
                "minibatch_size" => config.minibatch_size = json_positive(field, raw)?,
                "model_in_path" => config.model_in_path = json_optional_string(field, raw)?,
                "model_out_path" => config.model_out_path = json_optional_string(field, raw)?,
                "model_export_path" => {
                    config.model_export_path = json_optional_string(field, raw)?
                }
                "experiment_name" => config.experiment_name = json_optional_string(field, raw)?,
                _ => {
                    return Err(GlaiveError::config(
                        field,
                        raw.to_string(),
                        "is not a recognized option",
                    ));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Declared shard set for this configuration.
    pub fn manifest(&self) -> Result<ShardManifest> {
        ShardManifest::new(self.worker_count)
    }
}

fn json_positive(field: &str, raw: &JsonValue) -> Result<usize> {
    match raw.as_u64() {
        Some(value) if value > 0 => usize::try_from(value)
            .map_err(|_| GlaiveError::config(field, raw.to_string(), "is out of range")),
        _ => Err(GlaiveError::config(
            field,
            raw.to_string(),
            "must be a positive integer",
        )),
    }
}

fn json_string(field: &str, raw: &JsonValue) -> Result<String> {
    match raw.as_str() {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(GlaiveError::config(
            field,
            raw.to_string(),
            "must be a non-empty string",
        )),
    }
}

fn json_optional_string(field: &str, raw: &JsonValue) -> Result<Option<String>> {
    if raw.is_null() {
        return Ok(None);
    }
    json_string(field, raw).map(Some)
}

fn json_delimiter(field: &str, raw: &JsonValue) -> Result<char> {
    let mut chars = raw.as_str().map(str::chars);
    match chars.as_mut().map(|c| (c.next(), c.next())) {
        Some((Some(delimiter), None)) => Ok(delimiter),
        _ => Err(GlaiveError::config(
            field,
            raw.to_string(),
            "must be a string of length 1",
        )),
    }
}

fn json_indices(field: &str, raw: &JsonValue) -> Result<Vec<usize>> {
    let invalid = || {
        GlaiveError::config(
            field,
            raw.to_string(),
            "must be a list of non-negative integers",
        )
    };
    let items = raw.as_array().ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(invalid)
        })
        .collect()
}

/// A builder for [`RetrievalConfig`] that validates on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RetrievalConfigBuilder {
    config: RetrievalConfig,
}

impl RetrievalConfigBuilder {
    pub fn new(item_embedding_size: usize) -> Self {
        Self {
            config: RetrievalConfig {
                item_embedding_size,
                ..RetrievalConfig::default()
            },
        }
    }

    pub fn item_id_column_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.item_id_column_name = name.into();
        self
    }

    pub fn item_ids_column_indices(mut self, indices: Vec<usize>) -> Self {
        self.config.item_ids_column_indices = indices;
        self
    }

    pub fn delimiters(mut self, field: char, value: char) -> Self {
        self.config.item_ids_field_delimiter = field;
        self.config.item_ids_value_delimiter = value;
        self
    }

    pub fn output_item_embeddings(mut self, enabled: bool) -> Self {
        self.config.output_item_embeddings = enabled;
        self
    }

    pub fn increasing_id_column_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.increasing_id_column_name = name.into();
        self
    }

    pub fn recommendation_info_column_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.recommendation_info_column_name = name.into();
        self
    }

    pub fn retrieval_item_count(mut self, count: usize) -> Self {
        self.config.retrieval_item_count = count;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn minibatch_size(mut self, size: usize) -> Self {
        self.config.minibatch_size = size;
        self
    }

    pub fn model_in_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.model_in_path = Some(path.into());
        self
    }

    pub fn model_out_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.model_out_path = Some(path.into());
        self
    }

    /// Export the built tree to `<path><experiment_name>.ptm.msd/faiss/`.
    pub fn export_to<P: Into<String>, E: Into<String>>(mut self, path: P, experiment_name: E) -> Self {
        self.config.model_export_path = Some(path.into());
        self.config.experiment_name = Some(experiment_name.into());
        self
    }

    pub fn build(self) -> Result<RetrievalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Locations of one build's shards under a model path.
///
/// Storage backends address shards by relative name (see
/// [`ShardId::index_path`]); `PathLayout` renders the same names as full
/// locations for logging and export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    model_path: String,
    manifest: ShardManifest,
}

impl PathLayout {
    /// Layout under `model_path`, which is normalized to end in `/` and to
    /// use `s3://` for object-store paths.
    pub fn new(model_path: &str, manifest: ShardManifest) -> Self {
        let mut model_path = use_s3(model_path);
        if !model_path.is_empty() && !model_path.ends_with('/') {
            model_path.push('/');
        }
        Self {
            model_path,
            manifest,
        }
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn manifest(&self) -> &ShardManifest {
        &self.manifest
    }

    /// `<model_path>faiss/`
    pub fn faiss_dir(&self) -> String {
        format!("{}{FAISS_DIR}", self.model_path)
    }

    /// Full location of the index shard of `rank`.
    pub fn index_location(&self, rank: usize) -> Result<String> {
        let shard: ShardId = self.manifest.shard(rank)?;
        Ok(format!("{}{}", self.model_path, shard.index_path()))
    }

    /// Full location of the id file of `rank`.
    pub fn ids_location(&self, rank: usize) -> Result<String> {
        let shard: ShardId = self.manifest.shard(rank)?;
        Ok(format!("{}{}", self.model_path, shard.ids_path()))
    }
}
