//! `ivec` command implementations.
//!
//! Each command takes the opened storage handle and returns the JSON value
//! the binary prints. Keeping them free of I/O other than the group file
//! lets the same functions back tests against the in-memory store.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use item_vectors_core::models::{ChunkFilter, ChunkView, NewGroup, SearchQuery};
use item_vectors_core::ItemVectorStorage;

/// Arguments of `ivec search`.
#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub group_id: String,
    pub item_ids: Vec<String>,
    pub vector: Vec<f32>,
    pub top_k: usize,
    pub threshold: f64,
    pub chunk_type: Option<String>,
    pub best: bool,
}

/// Parse a query vector given as a JSON array (`[0.1, 0.2]`) or a plain
/// comma-separated list.
pub fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).with_context(|| "vector must be a JSON array of numbers");
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid vector component '{}'", part.trim()))
        })
        .collect()
}

/// Read a group definition (a [`NewGroup`] in TOML) from disk.
pub fn load_group_file(path: &Path) -> Result<NewGroup> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read group file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse group file: {}", path.display()))
}

pub async fn create_group(store: &dyn ItemVectorStorage, path: &Path) -> Result<Value> {
    let new_group = load_group_file(path)?;
    let group = store.create_group(new_group).await?;
    Ok(serde_json::to_value(group)?)
}

pub async fn list_groups(store: &dyn ItemVectorStorage, item_id: Option<&str>) -> Result<Value> {
    Ok(serde_json::to_value(store.list_groups(item_id).await?)?)
}

pub async fn show_group(store: &dyn ItemVectorStorage, group_id: &str) -> Result<Value> {
    let group = store.get_group(group_id).await?;
    let chunk_count = store.count_chunks(group_id).await?;
    let mut value = serde_json::to_value(group)?;
    value["chunk_count"] = json!(chunk_count);
    Ok(value)
}

pub async fn group_status(store: &dyn ItemVectorStorage, group_id: &str) -> Result<Value> {
    let status = store.get_status(group_id).await?;
    Ok(json!({ "group_id": group_id, "status": status }))
}

pub async fn delete_group(store: &dyn ItemVectorStorage, group_id: &str) -> Result<Value> {
    Ok(serde_json::to_value(store.delete_group(group_id).await?)?)
}

/// Chunks of an item, without embeddings.
pub async fn list_chunks(store: &dyn ItemVectorStorage, item_id: &str) -> Result<Value> {
    let chunks: Vec<ChunkView> = store
        .get_chunks_by_item_id(item_id)
        .await?
        .iter()
        .map(|c| c.view())
        .collect();
    Ok(json!({ "item_id": item_id, "total_count": chunks.len(), "chunks": chunks }))
}

pub async fn delete_item_chunks(store: &dyn ItemVectorStorage, item_id: &str) -> Result<Value> {
    let deleted = store.delete_chunks_by_item_id(item_id).await?;
    Ok(json!({ "item_id": item_id, "deleted_chunk_count": deleted }))
}

pub async fn search(store: &dyn ItemVectorStorage, args: SearchArgs) -> Result<Value> {
    let filter = match args.chunk_type {
        Some(chunk_type) => ChunkFilter::chunk_type(chunk_type),
        None => ChunkFilter::default(),
    };
    let query = SearchQuery::new(args.group_id, args.vector)
        .items(args.item_ids)
        .top_k(args.top_k)
        .threshold(args.threshold)
        .filter(filter);

    if args.best {
        let best = store.semantic_search(&query).await?;
        return Ok(serde_json::to_value(best)?);
    }
    let hits = store.search_chunks(&query).await?;
    Ok(json!({ "total_count": hits.len(), "results": hits }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use item_vectors_core::models::ItemChunk;
    use item_vectors_core::store::memory::InMemoryStore;
    use std::io::Write;

    const GROUP_TOML: &str = r#"
name = "textbook-v1"
tags = ["textbook"]

[chunking_config]
strategy = "paragraph"
max_tokens = 512
overlap_tokens = 32

[embedding_config]
provider = "local"
model = "minilm"
dimension = 4
"#;

    fn group_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_vector_forms() {
        assert_eq!(parse_vector("[1, 0.5, 0]").unwrap(), vec![1.0, 0.5, 0.0]);
        assert_eq!(parse_vector(" 1,0.5 ,0 ").unwrap(), vec![1.0, 0.5, 0.0]);
        assert!(parse_vector("1,x").is_err());
        assert!(parse_vector("[1, \"a\"]").is_err());
    }

    #[tokio::test]
    async fn test_create_then_search_best() {
        let store = InMemoryStore::new();
        let file = group_file(GROUP_TOML);
        let created = create_group(&store, file.path()).await.unwrap();
        assert_eq!(created["status"], "WAIT_FOR_CHUNK_EMBED");
        let group_id = created["id"].as_str().unwrap().to_string();

        let group = store.get_group(&group_id).await.unwrap();
        store
            .batch_insert_chunks(
                &group,
                vec![
                    ItemChunk::new("book", 0, "intro", vec![1.0, 0.0, 0.0, 0.0]).with_id("c1"),
                    ItemChunk::new("book", 1, "body", vec![0.9, 0.1, 0.0, 0.0]).with_id("c2"),
                ],
            )
            .await
            .unwrap();

        let args = SearchArgs {
            group_id: group_id.clone(),
            item_ids: vec!["book".to_string()],
            vector: vec![1.0, 0.0, 0.0, 0.0],
            top_k: 2,
            threshold: 0.5,
            chunk_type: None,
            best: false,
        };
        let ranked = search(&store, args.clone()).await.unwrap();
        assert_eq!(ranked["total_count"], 2);
        assert_eq!(ranked["results"][0]["id"], "c1");

        let best = search(&store, SearchArgs { best: true, ..args }).await.unwrap();
        assert_eq!(best["id"], "c1");
        assert!(best.get("embedding").is_none());

        let shown = show_group(&store, &group_id).await.unwrap();
        assert_eq!(shown["chunk_count"], 2);
        assert_eq!(shown["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_status_and_delete_of_unknown_group() {
        let store = InMemoryStore::new();
        let status = group_status(&store, "nope").await.unwrap();
        assert_eq!(status["status"], "FAILED");

        let deleted = delete_group(&store, "nope").await.unwrap();
        assert_eq!(deleted["deleted_group_id"], "nope");
        assert_eq!(deleted["deleted_chunk_count"], 0);
    }

    #[tokio::test]
    async fn test_invalid_group_file_rejected() {
        let store = InMemoryStore::new();
        let file = group_file(&GROUP_TOML.replace("dimension = 4", "dimension = 0"));
        let err = create_group(&store, file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));

        let unknown = group_file(&GROUP_TOML.replace("\"paragraph\"", "\"semantic\""));
        assert!(create_group(&store, unknown.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_chunks_listing_and_item_delete() {
        let store = InMemoryStore::new();
        let file = group_file(GROUP_TOML);
        let created = create_group(&store, file.path()).await.unwrap();
        let group = store
            .get_group(created["id"].as_str().unwrap())
            .await
            .unwrap();
        store
            .insert_chunk(&group, ItemChunk::new("doc", 0, "text", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let listed = list_chunks(&store, "doc").await.unwrap();
        assert_eq!(listed["total_count"], 1);
        assert!(listed["chunks"][0].get("embedding").is_none());

        let deleted = delete_item_chunks(&store, "doc").await.unwrap();
        assert_eq!(deleted["deleted_chunk_count"], 1);
        let again = delete_item_chunks(&store, "doc").await.unwrap();
        assert_eq!(again["deleted_chunk_count"], 0);
    }
}
