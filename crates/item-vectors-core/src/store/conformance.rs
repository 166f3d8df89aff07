//! Behavior checks every [`ItemVectorStorage`] backend must pass.
//!
//! Each check creates its own groups and uses fresh item ids, so the suite
//! can run against a shared database or cluster. Checks panic on failure,
//! like ordinary test assertions.

use uuid::Uuid;

use crate::error::Error;
use crate::models::{
    ChunkFilter, ChunkMetadata, ChunkingConfig, ChunkingStrategy, EmbeddingConfig,
    EmbeddingProvider, GroupStatus, GroupUpdate, ItemChunk, NewGroup, SearchQuery,
};

use super::ItemVectorStorage;

pub fn sample_group(name: &str, dimension: usize) -> NewGroup {
    NewGroup {
        name: name.to_string(),
        description: Some("conformance".to_string()),
        chunking_config: ChunkingConfig {
            strategy: ChunkingStrategy::Paragraph,
            max_tokens: 512,
            overlap_tokens: 64,
        },
        embedding_config: EmbeddingConfig {
            provider: EmbeddingProvider::Local,
            model: "conformance-model".to_string(),
            dimension,
            batch_size: 16,
            max_retries: 2,
            timeout_secs: 10,
        },
        is_default: false,
        is_active: true,
        created_by: Some("conformance".to_string()),
        tags: vec!["test".to_string()],
    }
}

fn fresh_item() -> String {
    format!("item-{}", Uuid::new_v4())
}

fn unit(dimension: usize, hot: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[hot % dimension] = 1.0;
    v
}

pub async fn check_reference_scenario(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("scenario", 4)).await.unwrap();
    let item = fresh_item();
    let c1 = format!("c1-{}", Uuid::new_v4());
    let c2 = format!("c2-{}", Uuid::new_v4());

    assert!(store
        .insert_chunk(
            &group,
            ItemChunk::new(&item, 0, "first", vec![1.0, 0.0, 0.0, 0.0]).with_id(&c1)
        )
        .await
        .unwrap());
    assert!(store
        .insert_chunk(
            &group,
            ItemChunk::new(&item, 1, "second", vec![0.9, 0.1, 0.0, 0.0]).with_id(&c2)
        )
        .await
        .unwrap());

    let ranked = store
        .semantic_search_by_item_and_group(&item, &group.id, vec![1.0, 0.0, 0.0, 0.0], 2, 0.5, None)
        .await
        .unwrap();
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].chunk.id, c1);
    assert!((ranked[0].similarity - 1.0).abs() < 1e-3);
    assert_eq!(ranked[1].chunk.id, c2);
    assert!((ranked[1].similarity - 0.994).abs() < 1e-3);

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_insert_rejects_mismatch(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("mismatch", 4)).await.unwrap();
    let item = fresh_item();

    let err = store
        .insert_chunk(&group, ItemChunk::new(&item, 0, "short", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::DimensionMismatch {
            expected: 4,
            actual: 3
        }
    );
    assert!(store.get_chunks_by_item_id(&item).await.unwrap().is_empty());
    assert_eq!(store.count_chunks(&group.id).await.unwrap(), 0);
    assert_eq!(
        store.get_status(&group.id).await.unwrap(),
        GroupStatus::Pending
    );

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_batch_atomicity(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("batch", 3)).await.unwrap();
    let item = fresh_item();

    let mut batch: Vec<ItemChunk> = (0..5)
        .map(|i| ItemChunk::new(&item, i, format!("chunk {}", i), unit(3, i as usize)))
        .collect();
    batch.insert(2, ItemChunk::new(&item, 99, "bad", vec![1.0, 0.0]));

    let err = store.batch_insert_chunks(&group, batch).await.unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
    assert!(store.get_chunks_by_item_id(&item).await.unwrap().is_empty());
    let hits = store
        .semantic_search_by_item_and_group(&item, &group.id, unit(3, 0), 10, -1.0, None)
        .await
        .unwrap();
    assert!(hits.is_empty());

    let good: Vec<ItemChunk> = (0..4)
        .map(|i| ItemChunk::new(&item, i, format!("chunk {}", i), unit(3, i as usize)))
        .collect();
    assert!(store.batch_insert_chunks(&group, good).await.unwrap());
    let stored = store.get_chunks_by_item_id(&item).await.unwrap();
    assert_eq!(stored.len(), 4);
    let indices: Vec<i64> = stored.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert!(stored.iter().all(|c| c.embedding.len() == 3));
    assert!(stored.iter().all(|c| c.strategy_metadata.is_some()));
    assert_eq!(
        store.get_status(&group.id).await.unwrap(),
        GroupStatus::Completed
    );

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_cascade_delete(store: &dyn ItemVectorStorage) {
    let doomed = store.create_group(sample_group("doomed", 2)).await.unwrap();
    let kept = store.create_group(sample_group("kept", 2)).await.unwrap();
    let item = fresh_item();

    let chunks: Vec<ItemChunk> = (0..3)
        .map(|i| ItemChunk::new(&item, i, "text", unit(2, i as usize)))
        .collect();
    store.batch_insert_chunks(&doomed, chunks).await.unwrap();
    store
        .insert_chunk(&kept, ItemChunk::new(&item, 0, "survivor", vec![1.0, 1.0]))
        .await
        .unwrap();

    let listed = store.list_groups(Some(&item)).await.unwrap();
    assert_eq!(listed.total_count, 2);

    let deletion = store.delete_group(&doomed.id).await.unwrap();
    assert_eq!(deletion.deleted_group_id, doomed.id);
    assert_eq!(deletion.deleted_chunk_count, 3);

    let remaining = store.get_chunks_by_item_id(&item).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].group_id, kept.id);
    assert!(matches!(
        store.get_group(&doomed.id).await,
        Err(Error::NotFound(_))
    ));

    let listed = store.list_groups(Some(&item)).await.unwrap();
    assert_eq!(listed.total_count, 1);
    assert_eq!(listed.groups[0].id, kept.id);

    let err = store
        .insert_chunk(&doomed, ItemChunk::new(&item, 5, "late", vec![1.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(store.count_chunks(&doomed.id).await.unwrap(), 0);
    assert_eq!(store.get_chunks_by_item_id(&item).await.unwrap().len(), 1);

    store.delete_group(&kept.id).await.unwrap();
}

pub async fn check_idempotent_delete(store: &dyn ItemVectorStorage) {
    let missing = format!("missing-{}", Uuid::new_v4());
    for _ in 0..2 {
        let deletion = store.delete_group(&missing).await.unwrap();
        assert_eq!(deletion.deleted_group_id, missing);
        assert_eq!(deletion.deleted_chunk_count, 0);
    }
    assert_eq!(store.delete_chunks_by_item_id(&fresh_item()).await.unwrap(), 0);
    assert_eq!(store.delete_chunks_by_group_id(&missing).await.unwrap(), 0);
    assert_eq!(
        store.get_status(&missing).await.unwrap(),
        GroupStatus::Failed
    );
}

pub async fn check_deterministic_ranking(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("ranking", 3)).await.unwrap();
    let item = fresh_item();

    // Pairs of identical vectors force ties that only the index can break.
    let vectors = [
        vec![1.0, 0.2, 0.0],
        vec![0.3, 1.0, 0.0],
        vec![1.0, 0.2, 0.0],
        vec![0.5, 0.5, 0.5],
        vec![0.3, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
    ];
    let batch: Vec<ItemChunk> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| ItemChunk::new(&item, i as i64, format!("c{}", i), v.clone()))
        .collect();
    store.batch_insert_chunks(&group, batch).await.unwrap();

    let query = vec![0.8, 0.6, 0.1];
    let first = store
        .semantic_search_by_item_and_group(&item, &group.id, query.clone(), 6, -1.0, None)
        .await
        .unwrap();
    assert_eq!(first.len(), 6);
    for pair in first.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
        if (pair[0].similarity - pair[1].similarity).abs() < 1e-9 {
            assert!(pair[0].chunk.index < pair[1].chunk.index);
        }
    }
    for _ in 0..3 {
        let again = store
            .semantic_search_by_item_and_group(&item, &group.id, query.clone(), 6, -1.0, None)
            .await
            .unwrap();
        let a: Vec<&str> = first.iter().map(|r| r.chunk.id.as_str()).collect();
        let b: Vec<&str> = again.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(a, b);
    }

    let top2 = store
        .semantic_search_by_item_and_group(&item, &group.id, query, 2, -1.0, None)
        .await
        .unwrap();
    assert_eq!(top2.len(), 2);
    assert_eq!(top2[0].chunk.id, first[0].chunk.id);
    assert_eq!(top2[1].chunk.id, first[1].chunk.id);

    store.delete_group(&group.id).await.unwrap();
}

/// Chunks tied on similarity across the top-K cut are resolved by index,
/// whatever order they were written in.
pub async fn check_tie_break_at_cut(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("ties", 2)).await.unwrap();
    let item = fresh_item();
    for index in [5, 1] {
        store
            .insert_chunk(
                &group,
                ItemChunk::new(&item, index, format!("copy {}", index), vec![0.6, 0.8]),
            )
            .await
            .unwrap();
    }

    let by_item = store
        .semantic_search_by_item_and_group(&item, &group.id, vec![0.6, 0.8], 1, -1.0, None)
        .await
        .unwrap();
    assert_eq!(by_item.len(), 1);
    assert_eq!(by_item[0].chunk.index, 1);

    let whole_group = SearchQuery::new(&group.id, vec![0.6, 0.8])
        .top_k(1)
        .threshold(-1.0);
    let hits = store.search_chunks(&whole_group).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.index, 1);

    store.delete_group(&group.id).await.unwrap();
}

/// Narrowing a search to one item (or one chunk type) must find that
/// item's chunks even when thousands of other chunks in the group are
/// nearer to the query.
pub async fn check_narrow_search_in_large_group(store: &dyn ItemVectorStorage) {
    let dimension = 8;
    let group = store
        .create_group(sample_group("crowded", dimension))
        .await
        .unwrap();
    let crowd = fresh_item();
    let target = fresh_item();

    for batch_no in 0..4 {
        let batch: Vec<ItemChunk> = (0..500usize)
            .map(|i| {
                let mut v = unit(dimension, 0);
                v[1 + i % (dimension - 1)] = 0.01 * (1 + i % 5) as f32;
                ItemChunk::new(
                    format!("{}-{}", crowd, (batch_no * 500 + i) / 10),
                    (i % 10) as i64,
                    "crowd",
                    v,
                )
            })
            .collect();
        store.batch_insert_chunks(&group, batch).await.unwrap();
    }
    let appendix = ChunkMetadata {
        chunk_type: Some("appendix".to_string()),
        ..Default::default()
    };
    let far: Vec<ItemChunk> = (0..3)
        .map(|i| {
            ItemChunk::new(&target, i, format!("far {}", i), unit(dimension, dimension - 1))
                .with_metadata(appendix.clone())
        })
        .collect();
    store.batch_insert_chunks(&group, far).await.unwrap();
    assert_eq!(store.count_chunks(&group.id).await.unwrap(), 2003);

    let query = unit(dimension, 0);
    let by_item = store
        .semantic_search_by_item_and_group(&target, &group.id, query.clone(), 3, -1.0, None)
        .await
        .unwrap();
    let indices: Vec<i64> = by_item.iter().map(|r| r.chunk.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(by_item.iter().all(|r| r.chunk.item_id == target));

    let by_type = store
        .search_chunks(
            &SearchQuery::new(&group.id, query.clone())
                .top_k(5)
                .threshold(-1.0)
                .filter(ChunkFilter::chunk_type("appendix")),
        )
        .await
        .unwrap();
    assert_eq!(by_type.len(), 3);

    let deep = store
        .search_chunks(&SearchQuery::new(&group.id, query).top_k(100).threshold(-1.0))
        .await
        .unwrap();
    assert_eq!(deep.len(), 100);
    assert!(deep.iter().all(|r| r.chunk.item_id != target));

    store.delete_group(&group.id).await.unwrap();
}

/// A chunk id belongs to the group it was first written to until that
/// group is deleted.
pub async fn check_chunk_id_bound_to_group(store: &dyn ItemVectorStorage) {
    let owner = store.create_group(sample_group("owner", 2)).await.unwrap();
    let other = store.create_group(sample_group("other", 3)).await.unwrap();
    let item = fresh_item();
    let id = format!("bound-{}", Uuid::new_v4());

    store
        .insert_chunk(
            &owner,
            ItemChunk::new(&item, 0, "original", vec![1.0, 0.0]).with_id(&id),
        )
        .await
        .unwrap();

    let err = store
        .insert_chunk(
            &other,
            ItemChunk::new(&item, 0, "moved", unit(3, 0)).with_id(&id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let batch = vec![
        ItemChunk::new(&item, 1, "fresh", unit(3, 1)),
        ItemChunk::new(&item, 2, "moved", unit(3, 2)).with_id(&id),
    ];
    let err = store.batch_insert_chunks(&other, batch).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    assert_eq!(store.count_chunks(&owner.id).await.unwrap(), 1);
    assert_eq!(store.count_chunks(&other.id).await.unwrap(), 0);
    assert_eq!(
        store.get_status(&other.id).await.unwrap(),
        GroupStatus::Pending
    );

    // Rewriting within the owning group is still an upsert.
    store
        .insert_chunk(
            &owner,
            ItemChunk::new(&item, 0, "revised", vec![0.0, 1.0]).with_id(&id),
        )
        .await
        .unwrap();
    let stored = store.get_chunks_by_item_id(&item).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].group_id, owner.id);
    assert_eq!(stored[0].content, "revised");

    store.delete_group(&owner.id).await.unwrap();
    store
        .insert_chunk(
            &other,
            ItemChunk::new(&item, 0, "reused", unit(3, 0)).with_id(&id),
        )
        .await
        .unwrap();
    assert_eq!(store.count_chunks(&other.id).await.unwrap(), 1);

    store.delete_group(&other.id).await.unwrap();
}

pub async fn check_multi_dimension_isolation(store: &dyn ItemVectorStorage) {
    let small = store.create_group(sample_group("dim-512", 512)).await.unwrap();
    let large = store.create_group(sample_group("dim-1536", 1536)).await.unwrap();
    let item = fresh_item();

    store
        .insert_chunk(&small, ItemChunk::new(&item, 0, "small", unit(512, 7)))
        .await
        .unwrap();
    store
        .insert_chunk(&large, ItemChunk::new(&item, 0, "large", unit(1536, 7)))
        .await
        .unwrap();

    let small_hits = store
        .semantic_search_by_item_and_group(&item, &small.id, unit(512, 7), 5, 0.0, None)
        .await
        .unwrap();
    assert_eq!(small_hits.len(), 1);
    assert_eq!(small_hits[0].chunk.group_id, small.id);

    let large_hits = store
        .semantic_search_by_item_and_group(&item, &large.id, unit(1536, 7), 5, 0.0, None)
        .await
        .unwrap();
    assert_eq!(large_hits.len(), 1);
    assert_eq!(large_hits[0].chunk.group_id, large.id);

    let err = store
        .semantic_search_by_item_and_group(&item, &large.id, unit(512, 7), 5, 0.0, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::DimensionMismatch {
            expected: 1536,
            actual: 512
        }
    );

    let both = store.get_chunks_by_item_id(&item).await.unwrap();
    assert_eq!(both.len(), 2);

    store.delete_group(&small.id).await.unwrap();
    store.delete_group(&large.id).await.unwrap();
}

pub async fn check_search_forms(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("forms", 2)).await.unwrap();
    let item = fresh_item();
    store
        .insert_chunk(&group, ItemChunk::new(&item, 0, "east", vec![1.0, 0.0]))
        .await
        .unwrap();

    let query = SearchQuery::new(&group.id, vec![0.0, 1.0])
        .items([item.clone()])
        .top_k(3)
        .threshold(0.9);
    let plural = store.search_chunks(&query).await.unwrap();
    assert!(plural.is_empty());
    let single = store.semantic_search(&query).await.unwrap_err();
    assert!(matches!(single, Error::NotFound(_)));

    let best = store
        .semantic_search(&query.clone().threshold(-1.0))
        .await
        .unwrap();
    assert_eq!(best.content, "east");

    let unknown = SearchQuery::new(format!("missing-{}", Uuid::new_v4()), vec![1.0, 0.0]);
    assert!(matches!(
        store.search_chunks(&unknown).await,
        Err(Error::NotFound(_))
    ));

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_filter_before_top_k(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("filter", 2)).await.unwrap();
    let item = fresh_item();
    let prose = ChunkMetadata {
        chunk_type: Some("prose".to_string()),
        word_count: Some(120),
        ..Default::default()
    };
    let table = ChunkMetadata {
        chunk_type: Some("table".to_string()),
        ..Default::default()
    };
    store
        .batch_insert_chunks(
            &group,
            vec![
                ItemChunk::new(&item, 0, "best prose", vec![1.0, 0.0]).with_metadata(prose),
                ItemChunk::new(&item, 1, "weaker table", vec![1.0, 0.6]).with_metadata(table),
            ],
        )
        .await
        .unwrap();

    let hits = store
        .semantic_search_by_item_and_group(
            &item,
            &group.id,
            vec![1.0, 0.0],
            1,
            0.0,
            Some(ChunkFilter::chunk_type("table")),
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.content, "weaker table");

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_status_lifecycle(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("status", 2)).await.unwrap();
    assert_eq!(group.status, GroupStatus::Pending);

    let processing = store
        .set_status(&group.id, GroupStatus::Processing)
        .await
        .unwrap();
    assert_eq!(processing.status, GroupStatus::Processing);

    store
        .insert_chunk(
            &group,
            ItemChunk::new(fresh_item(), 0, "text", vec![0.0, 1.0]),
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_status(&group.id).await.unwrap(),
        GroupStatus::Completed
    );

    let err = store
        .set_status(&group.id, GroupStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStatusTransition { .. }));

    // Emptying a completed group does not un-complete it.
    store.delete_chunks_by_group_id(&group.id).await.unwrap();
    assert_eq!(
        store.get_status(&group.id).await.unwrap(),
        GroupStatus::Completed
    );

    let failed = store.create_group(sample_group("failing", 2)).await.unwrap();
    store.set_status(&failed.id, GroupStatus::Failed).await.unwrap();
    assert!(store
        .set_status(&failed.id, GroupStatus::Completed)
        .await
        .is_err());

    store.delete_group(&group.id).await.unwrap();
    store.delete_group(&failed.id).await.unwrap();
}

pub async fn check_dimension_frozen(store: &dyn ItemVectorStorage) {
    let group = store.create_group(sample_group("frozen", 2)).await.unwrap();
    let mut wider = group.embedding_config.clone();
    wider.dimension = 3;

    let renamed = store
        .update_group(
            &group.id,
            GroupUpdate {
                name: Some("frozen-renamed".to_string()),
                embedding_config: Some(wider.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "frozen-renamed");
    assert_eq!(renamed.dimension(), 3);

    store
        .insert_chunk(&renamed, ItemChunk::new(fresh_item(), 0, "x", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let mut narrower = wider;
    narrower.dimension = 2;
    let err = store
        .update_group(
            &group.id,
            GroupUpdate {
                embedding_config: Some(narrower),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(store.get_group(&group.id).await.unwrap().dimension(), 3);

    store.delete_group(&group.id).await.unwrap();
}

pub async fn check_rejects_invalid_group(store: &dyn ItemVectorStorage) {
    let before = store.list_groups(None).await.unwrap().total_count;
    let err = store
        .create_group(sample_group("zero", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(store.list_groups(None).await.unwrap().total_count, before);
}

/// Run every check in sequence.
pub async fn run_all(store: &dyn ItemVectorStorage) {
    check_reference_scenario(store).await;
    check_insert_rejects_mismatch(store).await;
    check_batch_atomicity(store).await;
    check_cascade_delete(store).await;
    check_idempotent_delete(store).await;
    check_deterministic_ranking(store).await;
    check_tie_break_at_cut(store).await;
    check_narrow_search_in_large_group(store).await;
    check_chunk_id_bound_to_group(store).await;
    check_multi_dimension_isolation(store).await;
    check_search_forms(store).await;
    check_filter_before_top_k(store).await;
    check_status_lifecycle(store).await;
    check_dimension_frozen(store).await;
    check_rejects_invalid_group(store).await;
}
