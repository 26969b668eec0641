//! Phase sequencing.
//!
//! Training: train → reload the artifact → build one shard per rank → export.
//! The build phase runs with `model_in_path` set to the training output and
//! loads the model from there, never from an in-memory model handed over by
//! training.
//!
//! Serving: a [`ServingSession`] loads the model from `model_in_path`,
//! assembles the index and loads candidate metadata once, then answers query
//! batches with retrieval workers, a checkpoint and reconstruction.

use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::{PathLayout, RetrievalConfig};
use crate::dataset::Dataset;
use crate::error::{GlaiveError, Result};
use crate::model::{ModelLoader, Tower, Trainer, TrainingSummary, TwoTowerModel};
use crate::pipeline::{Checkpoint, Stage};
use crate::reconstruct::{RecommendationTable, ResultReconstructor};
use crate::storage::SharedStorage;
use crate::storage::export::ExportPlan;
use crate::vector::index::AnnIndex;
use crate::vector::index::assembler::ShardedIndexAssembler;
use crate::vector::index::sharded::ShardedIndex;
use crate::worker::builder::{BuildContext, BuildReport, ShardBuildingWorker};
use crate::worker::id_file::{IdFileFormat, IdFileReader, MetadataTable};
use crate::worker::retrieval::{RetrievalContext, RetrievalWorker, RowCountSummary, SearchRow};

async fn join_workers<T>(handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    try_join_all(handles)
        .await
        .map_err(|err| GlaiveError::other(format!("worker task failed: {err}")))?
        .into_iter()
        .collect()
}

async fn run_blocking<T, F>(what: &'static str, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| GlaiveError::other(format!("{what} task failed: {err}")))?
}

fn required_path<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| GlaiveError::config(field, "null", "is required for this phase"))
}

/// Load the model artifact at `config.model_in_path` and reload its tower
/// schemas.
///
/// Fails when `model_in_path` is unset or the model's embedding size differs
/// from `item_embedding_size`.
pub async fn load_model(
    config: &RetrievalConfig,
    loader: &dyn ModelLoader,
) -> Result<TwoTowerModel> {
    let model_in_path = required_path("model_in_path", &config.model_in_path)?;
    let model = loader.load(model_in_path).await?;
    model.reload_schemas()?;
    if model.embedding_size() != config.item_embedding_size {
        return Err(GlaiveError::config(
            "item_embedding_size",
            config.item_embedding_size.to_string(),
            format!("model produces embeddings of size {}", model.embedding_size()),
        ));
    }
    debug!(model_in_path, "loaded model artifact");
    Ok(model)
}

/// Build every shard of `config`'s manifest from `candidates`.
///
/// One tokio task runs per rank over that rank's contiguous partition.
/// `storage` must be rooted at the model path the shards belong to.
#[instrument(skip_all, fields(worker_count = config.worker_count))]
pub async fn build_index(
    config: Arc<RetrievalConfig>,
    tower: Arc<dyn Tower>,
    storage: SharedStorage,
    candidates: &Dataset,
) -> Result<Vec<BuildReport>> {
    let manifest = config.manifest()?;

    let mut handles = Vec::with_capacity(manifest.worker_count());
    for shard in manifest.shards() {
        let partition = candidates.partition(shard.worker_count, shard.rank)?;
        let context = BuildContext {
            config: Arc::clone(&config),
            tower: Arc::clone(&tower),
            storage: Arc::clone(&storage),
            shard,
        };
        handles.push(tokio::spawn(ShardBuildingWorker::run(context, partition)));
    }

    let reports = join_workers(handles).await?;
    if let Some(model_path) = config.model_in_path.as_deref() {
        let layout = PathLayout::new(model_path, manifest);
        for report in &reports {
            debug!(
                location = %layout.index_location(report.shard.rank)?,
                ntotal = report.ntotal,
                "wrote shard"
            );
        }
    }
    info!(
        shards = reports.len(),
        ntotal = reports.iter().map(|report| report.ntotal).sum::<usize>(),
        "index build finished"
    );
    Ok(reports)
}

/// Result of [`TrainingPipeline::fit`].
#[derive(Debug)]
pub struct FitOutcome {
    pub model: TwoTowerModel,
    pub training: TrainingSummary,
    pub shards: Vec<BuildReport>,
    /// Export destination, when an export path was configured.
    pub exported_to: Option<String>,
}

/// Training followed by index build and export.
pub struct TrainingPipeline {
    config: Arc<RetrievalConfig>,
    trainer: Arc<dyn Trainer>,
    loader: Arc<dyn ModelLoader>,
    storage: SharedStorage,
}

impl fmt::Debug for TrainingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingPipeline")
            .field("config", &self.config)
            .field("trainer", &self.trainer)
            .field("loader", &self.loader)
            .finish()
    }
}

impl TrainingPipeline {
    /// `storage` must be rooted at `config.model_out_path`.
    pub fn new(
        config: RetrievalConfig,
        trainer: Arc<dyn Trainer>,
        loader: Arc<dyn ModelLoader>,
        storage: SharedStorage,
    ) -> Result<Self> {
        config.validate()?;
        required_path("model_out_path", &config.model_out_path)?;
        Ok(Self {
            config: Arc::new(config),
            trainer,
            loader,
            storage,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Train, reload, build every shard and export.
    #[instrument(skip_all, fields(worker_count = self.config.worker_count))]
    pub async fn fit(&self, train: &Dataset, candidates: &Dataset) -> Result<FitOutcome> {
        let model_out_path = required_path("model_out_path", &self.config.model_out_path)?;

        let training = self.trainer.train(train, model_out_path).await?;
        info!(model_out_path, final_metric = ?training.final_metric, "training finished");

        let build_config = Arc::new(RetrievalConfig {
            model_in_path: Some(model_out_path.to_string()),
            ..RetrievalConfig::clone(&self.config)
        });
        let model = load_model(&build_config, self.loader.as_ref()).await?;

        let layout = PathLayout::new(model_out_path, build_config.manifest()?);
        info!(faiss_dir = %layout.faiss_dir(), "building index shards");
        let shards = build_index(
            Arc::clone(&build_config),
            model.candidate_tower(),
            Arc::clone(&self.storage),
            candidates,
        )
        .await?;

        let exported_to = match (&self.config.model_export_path, &self.config.experiment_name) {
            (Some(export_path), Some(experiment_name)) => {
                let plan = ExportPlan::new(model_out_path, export_path, experiment_name);
                plan.execute().await?;
                Some(plan.dst)
            }
            _ => None,
        };

        Ok(FitOutcome {
            model,
            training,
            shards,
            exported_to,
        })
    }
}

/// Serving resources kept for the lifetime of a serving cluster.
pub struct ServingSession {
    config: Arc<RetrievalConfig>,
    query_tower: Arc<dyn Tower>,
    index: Arc<ShardedIndex>,
    metadata: Arc<MetadataTable>,
    checkpoint_storage: SharedStorage,
}

impl fmt::Debug for ServingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingSession")
            .field("worker_count", &self.config.worker_count)
            .field("ntotal", &self.index.ntotal())
            .field("candidates", &self.metadata.len())
            .finish()
    }
}

impl ServingSession {
    /// Load the model from `config.model_in_path`, assemble every shard under
    /// `storage` and load the candidate metadata.
    ///
    /// `storage` must be rooted at `model_in_path`. Checkpoints are written to
    /// the same storage unless
    /// [`with_checkpoint_storage`](Self::with_checkpoint_storage) is used.
    #[instrument(skip_all, fields(worker_count = config.worker_count))]
    pub async fn open(
        config: RetrievalConfig,
        loader: &dyn ModelLoader,
        storage: SharedStorage,
    ) -> Result<Self> {
        config.validate()?;
        let model = load_model(&config, loader).await?;
        let manifest = config.manifest()?;
        let layout = PathLayout::new(
            required_path("model_in_path", &config.model_in_path)?,
            manifest,
        );
        info!(faiss_dir = %layout.faiss_dir(), "opening serving session");

        let assembler = ShardedIndexAssembler::new(Arc::clone(&storage), manifest)
            .with_expected_dimension(config.item_embedding_size);
        let index = run_blocking("index assembly", move || assembler.assemble()).await?;

        for shard in manifest.shards() {
            debug!(location = %layout.ids_location(shard.rank)?, "reading id file");
        }
        let reader = IdFileReader::new(manifest, IdFileFormat::from(&config));
        let metadata_storage = Arc::clone(&storage);
        let metadata =
            run_blocking("metadata load", move || reader.read(metadata_storage.as_ref())).await?;

        info!(
            ntotal = index.ntotal(),
            candidates = metadata.len(),
            "serving session ready"
        );
        Ok(Self {
            config: Arc::new(config),
            query_tower: model.query_tower(),
            index: Arc::new(index),
            metadata: Arc::new(metadata),
            checkpoint_storage: storage,
        })
    }

    /// Write retrieval checkpoints to `storage` instead.
    pub fn with_checkpoint_storage(mut self, storage: SharedStorage) -> Self {
        self.checkpoint_storage = storage;
        self
    }

    pub fn index(&self) -> &ShardedIndex {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    /// Run one retrieval worker per partition of `keyed` queries.
    ///
    /// Rows come back in input order.
    pub async fn retrieve(&self, keyed: &Dataset) -> Result<Vec<SearchRow>> {
        let worker_count = self.config.worker_count;
        let index: Arc<dyn AnnIndex> = self.index.clone();

        let mut handles = Vec::with_capacity(worker_count);
        for rank in 0..worker_count {
            let context = RetrievalContext {
                config: Arc::clone(&self.config),
                tower: Arc::clone(&self.query_tower),
                index: Arc::clone(&index),
                rank,
            };
            let partition = keyed.partition(worker_count, rank)?;
            handles.push(tokio::spawn(RetrievalWorker::run(context, partition)));
        }

        Ok(join_workers(handles).await?.into_iter().flatten().collect())
    }

    /// Retrieval only, summarized by result-list length.
    pub async fn summarize(&self, queries: &Dataset) -> Result<RowCountSummary> {
        let keyed = ResultReconstructor::from_config(&self.config).assign_keys(queries)?;
        let summary = RowCountSummary::from_rows(&self.retrieve(&keyed).await?);
        summary.log();
        Ok(summary)
    }

    /// Recommendations for every query row, in input order.
    #[instrument(skip_all, fields(queries = queries.len()))]
    pub async fn transform(&self, queries: &Dataset) -> Result<RecommendationTable> {
        let reconstructor = ResultReconstructor::from_config(&self.config);
        let keyed = reconstructor.assign_keys(queries)?;

        let rows = self.retrieve(&keyed).await?;
        RowCountSummary::from_rows(&rows).log();
        let storage = Arc::clone(&self.checkpoint_storage);
        let checkpoint = run_blocking("checkpoint", move || {
            Checkpoint::materialize(storage, Stage::Retrieval, &rows, rows.len())
        })
        .await?;

        let metadata = Arc::clone(&self.metadata);
        let table = run_blocking("reconstruction", move || {
            let rows = checkpoint.load()?;
            let table = reconstructor.reconstruct(&keyed, &rows, &metadata)?;
            checkpoint.discard()?;
            Ok(table)
        })
        .await?;

        info!(rows = table.len(), "reconstructed recommendations");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use async_trait::async_trait;

    use crate::model::{DotProductSimilarity, PrecomputedTower};
    use crate::storage::memory::MemoryStorage;

    const MODEL_PATH: &str = "s3://models/two-tower/";

    fn model() -> TwoTowerModel {
        TwoTowerModel::new(
            Arc::new(PrecomputedTower::new("emb", 2)),
            Arc::new(PrecomputedTower::new("emb", 2)),
            Arc::new(DotProductSimilarity),
        )
        .unwrap()
    }

    /// Serves one in-memory model from a single artifact path.
    #[derive(Debug)]
    struct StaticLoader;

    #[async_trait]
    impl ModelLoader for StaticLoader {
        async fn load(&self, model_path: &str) -> Result<TwoTowerModel> {
            if model_path != MODEL_PATH {
                return Err(GlaiveError::model(format!("no model at {model_path}")));
            }
            Ok(model())
        }
    }

    fn candidates() -> Dataset {
        let mut dataset = Dataset::new(["item_id", "title", "emb"]).unwrap();
        for (id, title, emb) in [
            (0, "origin", [0.0f32, 0.0]),
            (1, "east", [1.0, 0.0]),
            (2, "north", [0.0, 1.0]),
            (3, "far", [5.0, 5.0]),
        ] {
            dataset
                .push_row(vec![Value::Int(id), Value::from(title), Value::Vector(emb.to_vec())])
                .unwrap();
        }
        dataset
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig::builder(2)
            .item_ids_column_indices(vec![1])
            .worker_count(2)
            .retrieval_item_count(2)
            .model_in_path(MODEL_PATH)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_then_serve() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new_default());
        let reports = build_index(
            Arc::new(config()),
            model().candidate_tower(),
            Arc::clone(&storage),
            &candidates(),
        )
        .await
        .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().map(|r| r.ntotal).sum::<usize>(), 4);

        let session = ServingSession::open(config(), &StaticLoader, Arc::clone(&storage))
            .await
            .unwrap();
        assert_eq!(session.index().shard_count(), 2);

        let mut queries = Dataset::new(["user", "emb"]).unwrap();
        queries
            .push_row(vec![Value::from("u0"), Value::Vector(vec![0.0, 0.0])])
            .unwrap();
        queries
            .push_row(vec![Value::from("u1"), Value::Vector(vec![4.0, 4.0])])
            .unwrap();

        let table = session.transform(&queries).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].candidates.names(), vec!["origin", "east"]);
        assert_eq!(table.rows()[1].candidates.names()[0], "far");
        assert!(storage.list_files("checkpoints/").unwrap().is_empty());

        let summary = session.summarize(&queries).await.unwrap();
        assert_eq!(summary.count(2), 2);
    }

    #[tokio::test]
    async fn test_serving_without_shards_fails() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new_default());
        let result = ServingSession::open(config(), &StaticLoader, storage).await;
        assert!(matches!(result, Err(GlaiveError::ShardMissing { .. })));
    }

    #[tokio::test]
    async fn test_serving_loads_model_from_model_in_path() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new_default());
        build_index(
            Arc::new(config()),
            model().candidate_tower(),
            Arc::clone(&storage),
            &candidates(),
        )
        .await
        .unwrap();

        let mut elsewhere = config();
        elsewhere.model_in_path = Some("s3://models/does-not-exist/".to_string());
        let result = ServingSession::open(elsewhere, &StaticLoader, Arc::clone(&storage)).await;
        assert!(matches!(result, Err(GlaiveError::Model(_))));

        let mut unset = config();
        unset.model_in_path = None;
        match ServingSession::open(unset, &StaticLoader, storage).await {
            Err(GlaiveError::Config { field, .. }) => assert_eq!(field, "model_in_path"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_model_checks_embedding_size() {
        let wrong = RetrievalConfig::builder(3)
            .model_in_path(MODEL_PATH)
            .build()
            .unwrap();
        assert!(matches!(
            load_model(&wrong, &StaticLoader).await,
            Err(GlaiveError::Config { .. })
        ));
        assert_eq!(
            load_model(&config(), &StaticLoader).await.unwrap().embedding_size(),
            2
        );
    }
}
