use std::sync::Arc;

use glaive::config::RetrievalConfig;
use glaive::dataset::{Dataset, Value};
use glaive::error::{GlaiveError, Result};
use glaive::model::PrecomputedTower;
use glaive::orchestrator::build_index;
use glaive::storage::SharedStorage;
use glaive::storage::file::FileStorage;
use glaive::vector::index::AnnIndex;
use glaive::vector::index::assembler::ShardedIndexAssembler;
use glaive::vector::index::flat::FlatIndex;
use glaive::vector::{DistanceMetric, Vector};
use tempfile::TempDir;

fn candidates(count: usize) -> Result<Dataset> {
    let mut dataset = Dataset::new(["item_id", "title", "emb"])?;
    for i in 0..count {
        let x = i as f32;
        dataset.push_row(vec![
            Value::Int(i as i64),
            Value::from(format!("item-{i}")),
            Value::Vector(vec![x, (x * 0.37).sin(), (x * 0.11).cos()]),
        ])?;
    }
    Ok(dataset)
}

fn config(worker_count: usize) -> Result<RetrievalConfig> {
    RetrievalConfig::builder(3)
        .item_ids_column_indices(vec![1])
        .worker_count(worker_count)
        .retrieval_item_count(5)
        .minibatch_size(4)
        .build()
}

async fn build(dir: &TempDir, worker_count: usize, items: &Dataset) -> Result<SharedStorage> {
    let storage: SharedStorage = Arc::new(FileStorage::open(dir.path())?);
    build_index(
        Arc::new(config(worker_count)?),
        Arc::new(PrecomputedTower::new("emb", 3)),
        Arc::clone(&storage),
        items,
    )
    .await?;
    Ok(storage)
}

#[tokio::test]
async fn test_build_writes_one_shard_per_rank() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = build(&dir, 3, &candidates(10)?).await?;

    assert_eq!(
        storage.list_files("faiss/item_index/")?,
        vec![
            "faiss/item_index/part_3_0.dat",
            "faiss/item_index/part_3_1.dat",
            "faiss/item_index/part_3_2.dat",
        ]
    );
    assert_eq!(storage.list_files("faiss/item_ids/")?.len(), 3);
    assert!(dir.path().join("faiss/item_ids/part_3_2.dat").is_file());
    Ok(())
}

#[tokio::test]
async fn test_sharded_search_matches_single_index() -> Result<()> {
    let items = candidates(23)?;
    let dir = TempDir::new()?;
    let storage = build(&dir, 4, &items).await?;

    let assembled = ShardedIndexAssembler::new(storage, config(4)?.manifest()?)
        .with_expected_dimension(3)
        .assemble()?;
    assert_eq!(assembled.ntotal(), 23);

    let batch = items.as_minibatch();
    let mut reference = FlatIndex::new(3, DistanceMetric::L2);
    reference.add_with_ids(&batch.vectors("emb", 3)?, &batch.ids("item_id")?)?;

    let queries = vec![
        Vector::new(vec![0.0, 0.0, 1.0]),
        Vector::new(vec![11.5, 0.2, -0.4]),
        Vector::new(vec![30.0, 1.0, 1.0]),
    ];
    for k in [1, 5, 23, 50] {
        let sharded = assembled.search(&queries, k)?;
        let single = reference.search(&queries, k)?;
        assert_eq!(sharded, single, "k = {k}");
        assert!(sharded.iter().all(|hits| hits.len() == k.min(23)));
    }
    Ok(())
}

#[tokio::test]
async fn test_rebuilding_a_rank_is_idempotent() -> Result<()> {
    let items = candidates(8)?;
    let dir = TempDir::new()?;
    let storage = build(&dir, 2, &items).await?;
    let first = std::fs::read(dir.path().join("faiss/item_index/part_2_1.dat"))?;
    let first_ids = std::fs::read(dir.path().join("faiss/item_ids/part_2_1.dat"))?;

    build(&dir, 2, &items).await?;
    assert_eq!(
        std::fs::read(dir.path().join("faiss/item_index/part_2_1.dat"))?,
        first
    );
    assert_eq!(
        std::fs::read(dir.path().join("faiss/item_ids/part_2_1.dat"))?,
        first_ids
    );
    assert_eq!(storage.list_files("faiss/item_index/")?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_rank_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = build(&dir, 3, &candidates(9)?).await?;
    std::fs::remove_file(dir.path().join("faiss/item_index/part_3_1.dat"))?;

    let result = ShardedIndexAssembler::new(storage, config(3)?.manifest()?).assemble();
    match result {
        Err(GlaiveError::ShardMissing {
            worker_count,
            ranks,
        }) => {
            assert_eq!(worker_count, 3);
            assert_eq!(ranks, vec![1]);
        }
        other => panic!("expected missing shard, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_shards_of_other_worker_counts_are_ignored() -> Result<()> {
    let items = candidates(6)?;
    let dir = TempDir::new()?;
    build(&dir, 3, &items).await?;
    let storage = build(&dir, 2, &items).await?;

    let assembled = ShardedIndexAssembler::new(storage, config(2)?.manifest()?).assemble()?;
    assert_eq!(assembled.shard_count(), 2);
    assert_eq!(assembled.ntotal(), 6);
    Ok(())
}

#[tokio::test]
async fn test_flipped_byte_is_reported_as_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = build(&dir, 2, &candidates(6)?).await?;

    let path = dir.path().join("faiss/item_index/part_2_0.dat");
    let mut bytes = std::fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes)?;

    let result = ShardedIndexAssembler::new(storage, config(2)?.manifest()?).assemble();
    assert!(matches!(
        result,
        Err(GlaiveError::ShardCorrupt { rank: 0, .. })
    ));
    Ok(())
}
