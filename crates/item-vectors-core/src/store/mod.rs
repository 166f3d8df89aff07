//! Storage abstraction for item vectors.
//!
//! The [`ItemVectorStorage`] trait is the contract every backend
//! implements: the relational adapter (PostgreSQL + pgvector), the
//! search-engine adapter (Elasticsearch), and the [`memory`] reference
//! store. Callers pick one at deployment time and hold it as
//! `Arc<dyn ItemVectorStorage>`.
//!
//! Implementations must be `Send + Sync` to work with async runtimes, and
//! must not retry failed backend calls; retry policy belongs to the caller.

pub mod memory;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{
    ChunkEmbedGroup, ChunkFilter, ChunkView, GroupDeletion, GroupList, GroupStatus, GroupUpdate,
    ItemChunk, NewGroup, RankedChunk, SearchQuery,
};

/// Chunk and embedding storage, partitioned by configuration group.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_group`](ItemVectorStorage::create_group) | Validate and persist a new group |
/// | [`get_group`](ItemVectorStorage::get_group) | Fetch a group or fail with `NotFound` |
/// | [`list_groups`](ItemVectorStorage::list_groups) | All groups, or those holding chunks of one item |
/// | [`update_group`](ItemVectorStorage::update_group) | Patch a group; dimension is frozen once chunks exist |
/// | [`delete_group`](ItemVectorStorage::delete_group) | Delete a group and cascade to its chunks |
/// | [`set_status`](ItemVectorStorage::set_status) | Explicit status transition |
/// | [`get_status`](ItemVectorStorage::get_status) | Status, `FAILED` for unknown groups |
/// | [`insert_chunk`](ItemVectorStorage::insert_chunk) | Store one chunk |
/// | [`batch_insert_chunks`](ItemVectorStorage::batch_insert_chunks) | Store many chunks, all or nothing |
/// | [`get_chunks_by_item_id`](ItemVectorStorage::get_chunks_by_item_id) | Every chunk of an item, across groups |
/// | [`search_chunks`](ItemVectorStorage::search_chunks) | Ranked nearest neighbours within a group |
/// | [`semantic_search`](ItemVectorStorage::semantic_search) | Single best match or `NotFound` |
/// | [`semantic_search_by_item_and_group`](ItemVectorStorage::semantic_search_by_item_and_group) | Ranked matches for one item, possibly empty |
#[async_trait]
pub trait ItemVectorStorage: Send + Sync {
    /// Create tables or indices if missing. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn create_group(&self, new_group: NewGroup) -> Result<ChunkEmbedGroup>;

    async fn get_group(&self, group_id: &str) -> Result<ChunkEmbedGroup>;

    /// List groups, optionally only those holding chunks of `item_id`.
    /// Ordered by creation time, then id.
    async fn list_groups(&self, item_id: Option<&str>) -> Result<GroupList>;

    async fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<ChunkEmbedGroup>;

    /// Delete a group and every chunk referencing it. Deleting a missing
    /// group is not an error and reports zero deleted chunks.
    async fn delete_group(&self, group_id: &str) -> Result<GroupDeletion>;

    async fn set_status(&self, group_id: &str, status: GroupStatus) -> Result<ChunkEmbedGroup>;

    /// Current status of a group. An unknown group reports
    /// [`GroupStatus::Failed`]: nothing has been done for it and nothing can be.
    async fn get_status(&self, group_id: &str) -> Result<GroupStatus> {
        match self.get_group(group_id).await {
            Ok(group) => Ok(group.status),
            Err(Error::NotFound(_)) => Ok(GroupStatus::Failed),
            Err(e) => Err(e),
        }
    }

    /// Insert one chunk into `group`. Returns `true` on success; every
    /// failure is an error.
    async fn insert_chunk(&self, group: &ChunkEmbedGroup, chunk: ItemChunk) -> Result<bool>;

    /// Insert a batch of chunks into `group`. If any chunk is invalid none
    /// of them become visible.
    async fn batch_insert_chunks(
        &self,
        group: &ChunkEmbedGroup,
        chunks: Vec<ItemChunk>,
    ) -> Result<bool>;

    /// Every chunk of `item_id` across all groups, ordered by group and
    /// then by index.
    async fn get_chunks_by_item_id(&self, item_id: &str) -> Result<Vec<ItemChunk>>;

    async fn count_chunks(&self, group_id: &str) -> Result<u64>;

    async fn delete_chunks_by_item_id(&self, item_id: &str) -> Result<u64>;

    async fn delete_chunks_by_group_id(&self, group_id: &str) -> Result<u64>;

    /// Ranked nearest neighbours of `query.vector` within `query.group_id`.
    /// Returns an empty list when nothing qualifies; fails with `NotFound`
    /// for an unknown group and `DimensionMismatch` for a wrong-sized vector.
    async fn search_chunks(&self, query: &SearchQuery) -> Result<Vec<RankedChunk>>;

    /// The single best match for `query`, or `NotFound` if none qualifies.
    async fn semantic_search(&self, query: &SearchQuery) -> Result<ChunkView> {
        let best = self
            .search_chunks(&query.clone().top_k(query.top_k.max(1)))
            .await?;
        best.into_iter()
            .next()
            .map(|hit| hit.chunk)
            .ok_or_else(|| Error::NotFound("no results found".to_string()))
    }

    async fn semantic_search_by_item_and_group(
        &self,
        item_id: &str,
        group_id: &str,
        vector: Vec<f32>,
        top_k: usize,
        threshold: f64,
        filter: Option<ChunkFilter>,
    ) -> Result<Vec<RankedChunk>> {
        let query = SearchQuery::new(group_id, vector)
            .items([item_id])
            .top_k(top_k)
            .threshold(threshold)
            .filter(filter.unwrap_or_default());
        self.search_chunks(&query).await
    }
}

#[cfg(any(test, feature = "conformance"))]
pub mod conformance;
