//! In-memory [`ItemVectorStorage`] implementation for tests and local runs.
//!
//! Groups and chunks live in one `HashMap` pair behind a single
//! `std::sync::RwLock`, so every write (including group deletion with its
//! cascade and whole batches) is atomic with respect to readers. Vector
//! search is brute-force cosine similarity over the group's chunks.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::chunk::{prepare_batch, prepare_chunk, sort_item_chunks};
use crate::error::{Error, Result};
use crate::models::{
    ChunkEmbedGroup, GroupDeletion, GroupList, GroupStatus, GroupUpdate, ItemChunk, NewGroup,
    RankedChunk, SearchQuery,
};
use crate::registry::{apply_update, check_transition, sort_groups};
use crate::similarity::{rank_candidates, validate_query};

use super::ItemVectorStorage;

#[derive(Default)]
struct State {
    groups: HashMap<String, ChunkEmbedGroup>,
    chunks: HashMap<String, ItemChunk>,
}

impl State {
    fn group(&self, group_id: &str) -> Result<&ChunkEmbedGroup> {
        self.groups
            .get(group_id)
            .ok_or_else(|| Error::group_not_found(group_id))
    }

    fn count(&self, group_id: &str) -> u64 {
        self.chunks
            .values()
            .filter(|c| c.group_id == group_id)
            .count() as u64
    }

    /// Fails when any of `ids` is already stored under another group.
    fn check_ownership<'a>(
        &self,
        group_id: &str,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for id in ids {
            if let Some(existing) = self.chunks.get(id) {
                if existing.group_id != group_id {
                    return Err(Error::chunk_in_other_group(id, &existing.group_id));
                }
            }
        }
        Ok(())
    }

    fn mark_inserted(&mut self, group_id: &str) {
        if let Some(group) = self.groups.get_mut(group_id) {
            let next = group.status.after_insert();
            if next != group.status {
                group.status = next;
                group.updated_at = Utc::now();
            }
        }
    }
}

/// In-memory store for testing and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl ItemVectorStorage for InMemoryStore {
    async fn create_group(&self, new_group: NewGroup) -> Result<ChunkEmbedGroup> {
        let group = new_group.into_group(Utc::now())?;
        self.write()?.groups.insert(group.id.clone(), group.clone());
        info!(group_id = %group.id, dimension = group.dimension(), "created group");
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> Result<ChunkEmbedGroup> {
        self.read()?.group(group_id).cloned()
    }

    async fn list_groups(&self, item_id: Option<&str>) -> Result<GroupList> {
        let state = self.read()?;
        let mut groups: Vec<ChunkEmbedGroup> = state
            .groups
            .values()
            .filter(|g| match item_id {
                None => true,
                Some(item) => state
                    .chunks
                    .values()
                    .any(|c| c.group_id == g.id && c.item_id == item),
            })
            .cloned()
            .collect();
        sort_groups(&mut groups);
        let total_count = groups.len();
        Ok(GroupList {
            groups,
            total_count,
        })
    }

    async fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<ChunkEmbedGroup> {
        let mut state = self.write()?;
        let chunk_count = state.count(group_id);
        let patched = apply_update(state.group(group_id)?, update, chunk_count, Utc::now())?;
        state.groups.insert(patched.id.clone(), patched.clone());
        Ok(patched)
    }

    async fn delete_group(&self, group_id: &str) -> Result<GroupDeletion> {
        let mut state = self.write()?;
        let deleted_chunk_count = match state.groups.remove(group_id) {
            Some(_) => {
                let before = state.chunks.len();
                state.chunks.retain(|_, c| c.group_id != group_id);
                (before - state.chunks.len()) as u64
            }
            None => 0,
        };
        info!(group_id, deleted_chunk_count, "deleted group");
        Ok(GroupDeletion {
            deleted_group_id: group_id.to_string(),
            deleted_chunk_count,
        })
    }

    async fn set_status(&self, group_id: &str, status: GroupStatus) -> Result<ChunkEmbedGroup> {
        let mut state = self.write()?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::group_not_found(group_id))?;
        check_transition(group.status, status)?;
        if group.status != status {
            group.status = status;
            group.updated_at = Utc::now();
        }
        Ok(group.clone())
    }

    async fn insert_chunk(&self, group: &ChunkEmbedGroup, chunk: ItemChunk) -> Result<bool> {
        let now = Utc::now();
        // Reject bad input before taking the write lock.
        let chunk = prepare_chunk(group, chunk, now)?;

        let mut state = self.write()?;
        let stored = state.group(&group.id)?;
        let chunk = prepare_chunk(stored, chunk, now)?;
        state.check_ownership(&group.id, [chunk.id.as_str()])?;
        debug!(chunk_id = %chunk.id, group_id = %group.id, "insert chunk");
        state.chunks.insert(chunk.id.clone(), chunk);
        state.mark_inserted(&group.id);
        Ok(true)
    }

    async fn batch_insert_chunks(
        &self,
        group: &ChunkEmbedGroup,
        chunks: Vec<ItemChunk>,
    ) -> Result<bool> {
        let now = Utc::now();
        let chunks = prepare_batch(group, chunks, now)?;

        let mut state = self.write()?;
        let stored = state.group(&group.id)?;
        let chunks = prepare_batch(stored, chunks, now)?;
        if chunks.is_empty() {
            return Ok(true);
        }
        state.check_ownership(&group.id, chunks.iter().map(|c| c.id.as_str()))?;
        debug!(group_id = %group.id, count = chunks.len(), "batch insert chunks");
        for chunk in chunks {
            state.chunks.insert(chunk.id.clone(), chunk);
        }
        state.mark_inserted(&group.id);
        Ok(true)
    }

    async fn get_chunks_by_item_id(&self, item_id: &str) -> Result<Vec<ItemChunk>> {
        let state = self.read()?;
        let mut chunks: Vec<ItemChunk> = state
            .chunks
            .values()
            .filter(|c| c.item_id == item_id)
            .cloned()
            .collect();
        sort_item_chunks(&mut chunks);
        Ok(chunks)
    }

    async fn count_chunks(&self, group_id: &str) -> Result<u64> {
        Ok(self.read()?.count(group_id))
    }

    async fn delete_chunks_by_item_id(&self, item_id: &str) -> Result<u64> {
        let mut state = self.write()?;
        let before = state.chunks.len();
        state.chunks.retain(|_, c| c.item_id != item_id);
        let deleted = (before - state.chunks.len()) as u64;
        info!(item_id, deleted, "deleted chunks by item");
        Ok(deleted)
    }

    async fn delete_chunks_by_group_id(&self, group_id: &str) -> Result<u64> {
        let mut state = self.write()?;
        let before = state.chunks.len();
        state.chunks.retain(|_, c| c.group_id != group_id);
        let deleted = (before - state.chunks.len()) as u64;
        info!(group_id, deleted, "deleted chunks by group");
        Ok(deleted)
    }

    async fn search_chunks(&self, query: &SearchQuery) -> Result<Vec<RankedChunk>> {
        let state = self.read()?;
        let group = state.group(&query.group_id)?;
        validate_query(group.dimension(), query)?;
        Ok(rank_candidates(state.chunks.values(), query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[tokio::test]
    async fn test_reference_scenario() {
        conformance::check_reference_scenario(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_insert_rejects_mismatch() {
        conformance::check_insert_rejects_mismatch(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_batch_atomicity() {
        conformance::check_batch_atomicity(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        conformance::check_cascade_delete(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_idempotent_delete() {
        conformance::check_idempotent_delete(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_deterministic_ranking() {
        conformance::check_deterministic_ranking(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_tie_break_at_cut() {
        conformance::check_tie_break_at_cut(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_narrow_search_in_large_group() {
        conformance::check_narrow_search_in_large_group(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_chunk_id_bound_to_group() {
        conformance::check_chunk_id_bound_to_group(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_multi_dimension_isolation() {
        conformance::check_multi_dimension_isolation(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_search_forms() {
        conformance::check_search_forms(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_filter_before_top_k() {
        conformance::check_filter_before_top_k(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        conformance::check_status_lifecycle(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_dimension_frozen() {
        conformance::check_dimension_frozen(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_group() {
        conformance::check_rejects_invalid_group(&InMemoryStore::new()).await;
    }
}
