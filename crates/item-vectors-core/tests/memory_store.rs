use std::sync::Arc;

use item_vectors_core::models::{
    ChunkMetadata, ChunkingConfig, ChunkingStrategy, EmbeddingConfig, EmbeddingProvider,
    GroupStatus, ItemChunk, NewGroup, SearchQuery,
};
use item_vectors_core::store::memory::InMemoryStore;
use item_vectors_core::{Error, ItemVectorStorage};

fn group_config(name: &str, dimension: usize) -> NewGroup {
    NewGroup {
        name: name.to_string(),
        description: None,
        chunking_config: ChunkingConfig {
            strategy: ChunkingStrategy::Sentence,
            max_tokens: 300,
            overlap_tokens: 30,
        },
        embedding_config: EmbeddingConfig {
            provider: EmbeddingProvider::OpenAi,
            model: "text-embedding-3-small".to_string(),
            dimension,
            batch_size: 20,
            max_retries: 3,
            timeout_secs: 60,
        },
        is_default: true,
        is_active: true,
        created_by: Some("tester".to_string()),
        tags: vec!["cardiology".to_string()],
    }
}

fn store() -> Arc<dyn ItemVectorStorage> {
    Arc::new(InMemoryStore::new())
}

#[tokio::test]
async fn test_concrete_scenario_ranking() {
    let store = store();
    let group = store.create_group(group_config("A", 4)).await.unwrap();

    store
        .insert_chunk(
            &group,
            ItemChunk::new("book-1", 0, "aorta", vec![1.0, 0.0, 0.0, 0.0]).with_id("c1"),
        )
        .await
        .unwrap();
    store
        .insert_chunk(
            &group,
            ItemChunk::new("book-1", 1, "aortic valve", vec![0.9, 0.1, 0.0, 0.0]).with_id("c2"),
        )
        .await
        .unwrap();

    let ranked = store
        .semantic_search_by_item_and_group("book-1", &group.id, vec![1.0, 0.0, 0.0, 0.0], 2, 0.5, None)
        .await
        .unwrap();
    let ids: Vec<&str> = ranked.iter().map(|r| r.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
    assert!((ranked[0].similarity - 1.0).abs() < 1e-6);
    assert!((ranked[1].similarity - 0.994).abs() < 1e-3);
}

#[tokio::test]
async fn test_short_embedding_reports_expected_and_actual() {
    let store = store();
    let group = store.create_group(group_config("A", 4)).await.unwrap();

    let err = store
        .insert_chunk(&group, ItemChunk::new("book-1", 0, "x", vec![1.0, 2.0, 3.0]))
        .await
        .unwrap_err();
    match err {
        Error::DimensionMismatch { expected, actual } => {
            assert_eq!(expected, 4);
            assert_eq!(actual, 3);
        }
        other => panic!("expected DimensionMismatch, got {:?}", other),
    }
    assert!(err_is_client_fault(&store, &group.id).await);
}

async fn err_is_client_fault(store: &Arc<dyn ItemVectorStorage>, group_id: &str) -> bool {
    let query = SearchQuery::new(group_id, vec![1.0]);
    store
        .search_chunks(&query)
        .await
        .unwrap_err()
        .is_client_fault()
}

#[tokio::test]
async fn test_semantic_search_restricts_to_listed_items() {
    let store = store();
    let group = store.create_group(group_config("multi", 2)).await.unwrap();
    store
        .batch_insert_chunks(
            &group,
            vec![
                ItemChunk::new("book-1", 0, "from book one", vec![1.0, 0.0]),
                ItemChunk::new("book-2", 0, "from book two", vec![0.9, 0.2]),
                ItemChunk::new("book-3", 0, "from book three", vec![1.0, 0.05]),
            ],
        )
        .await
        .unwrap();

    let query = SearchQuery::new(&group.id, vec![1.0, 0.0])
        .items(["book-2", "book-3"])
        .top_k(1)
        .threshold(0.0);
    let best = store.semantic_search(&query).await.unwrap();
    assert_eq!(best.item_id, "book-3");

    let everything = store
        .search_chunks(&SearchQuery::new(&group.id, vec![1.0, 0.0]).top_k(10))
        .await
        .unwrap();
    assert_eq!(everything.len(), 3);
    assert_eq!(everything[0].chunk.item_id, "book-1");
}

#[tokio::test]
async fn test_strategy_snapshot_survives_group_patch() {
    let store = store();
    let group = store.create_group(group_config("snap", 2)).await.unwrap();
    store
        .insert_chunk(
            &group,
            ItemChunk::new("book-1", 0, "x", vec![1.0, 0.0]).with_metadata(ChunkMetadata {
                chunk_type: Some("prose".to_string()),
                start_offset: Some(0),
                end_offset: Some(1),
                word_count: Some(1),
            }),
        )
        .await
        .unwrap();

    let mut chunking = group.chunking_config.clone();
    chunking.max_tokens = 900;
    store
        .update_group(
            &group.id,
            item_vectors_core::models::GroupUpdate {
                chunking_config: Some(chunking),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let chunks = store.get_chunks_by_item_id("book-1").await.unwrap();
    let snapshot = chunks[0].strategy_metadata.as_ref().unwrap();
    assert_eq!(snapshot.chunking_config.max_tokens, 300);
    assert_eq!(chunks[0].metadata.as_ref().unwrap().word_count, Some(1));
}

#[tokio::test]
async fn test_delete_by_item_spans_groups() {
    let store = store();
    let a = store.create_group(group_config("a", 2)).await.unwrap();
    let b = store.create_group(group_config("b", 3)).await.unwrap();
    store
        .insert_chunk(&a, ItemChunk::new("book-1", 0, "x", vec![1.0, 0.0]))
        .await
        .unwrap();
    store
        .insert_chunk(&b, ItemChunk::new("book-1", 0, "x", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();
    store
        .insert_chunk(&b, ItemChunk::new("book-2", 0, "y", vec![0.0, 1.0, 0.0]))
        .await
        .unwrap();

    assert_eq!(store.delete_chunks_by_item_id("book-1").await.unwrap(), 2);
    assert_eq!(store.delete_chunks_by_item_id("book-1").await.unwrap(), 0);
    assert_eq!(store.count_chunks(&b.id).await.unwrap(), 1);
    assert_eq!(store.list_groups(None).await.unwrap().total_count, 2);
}

#[tokio::test]
async fn test_list_groups_is_stable() {
    let store = store();
    for name in ["one", "two", "three"] {
        store.create_group(group_config(name, 8)).await.unwrap();
    }
    let first = store.list_groups(None).await.unwrap();
    let second = store.list_groups(None).await.unwrap();
    assert_eq!(first.total_count, 3);
    assert_eq!(first, second);
    assert!(store
        .list_groups(Some("nothing-here"))
        .await
        .unwrap()
        .groups
        .is_empty());
}

#[tokio::test]
async fn test_concurrent_readers_see_whole_batches() {
    let store = store();
    let group = store.create_group(group_config("busy", 2)).await.unwrap();

    let writer = {
        let store = Arc::clone(&store);
        let group = group.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let batch = (0..5)
                    .map(|i| ItemChunk::new("book-1", round * 5 + i, "x", vec![1.0, i as f32]))
                    .collect();
                store.batch_insert_chunks(&group, batch).await.unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let n = store.get_chunks_by_item_id("book-1").await.unwrap().len();
                assert_eq!(n % 5, 0, "observed a partial batch of {} chunks", n);
                tokio::task::yield_now().await;
            }
        }));
    }

    writer.await.unwrap();
    for r in readers {
        r.await.unwrap();
    }
    assert_eq!(store.count_chunks(&group.id).await.unwrap(), 100);
    assert_eq!(
        store.get_status(&group.id).await.unwrap(),
        GroupStatus::Completed
    );
}
