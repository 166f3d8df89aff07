//! Chunk validation and preparation.
//!
//! Every backend routes writes through [`prepare_chunk`] or
//! [`prepare_batch`] before touching storage. These enforce the
//! group-scoped invariants:
//!
//! - the embedding length equals the group's declared dimension,
//! - every component of the embedding is finite,
//! - the chunk is bound to the group it is being inserted into,
//! - the strategy snapshot reflects the group configuration at insert time.
//!
//! A batch is validated in full before anything is returned, so a single
//! bad chunk rejects the whole batch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChunkEmbedGroup, ItemChunk, StrategyMetadata};

/// Fail with [`Error::DimensionMismatch`] unless `actual == expected`.
pub fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Validate `chunk` against `group` and stamp the group-derived fields.
pub fn prepare_chunk(
    group: &ChunkEmbedGroup,
    mut chunk: ItemChunk,
    now: DateTime<Utc>,
) -> Result<ItemChunk> {
    check_dimension(group.dimension(), chunk.embedding.len())?;

    if chunk.embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::Configuration(format!(
            "chunk {} has a non-finite embedding component",
            chunk.id
        )));
    }
    if !chunk.group_id.is_empty() && chunk.group_id != group.id {
        return Err(Error::Configuration(format!(
            "chunk {} belongs to group {}, not {}",
            chunk.id, chunk.group_id, group.id
        )));
    }
    if chunk.item_id.trim().is_empty() {
        return Err(Error::Configuration(format!(
            "chunk {} has no item_id",
            chunk.id
        )));
    }
    if chunk.index < 0 {
        return Err(Error::Configuration(format!(
            "chunk {} has negative index {}",
            chunk.id, chunk.index
        )));
    }

    if chunk.id.trim().is_empty() {
        chunk.id = Uuid::new_v4().to_string();
    }
    chunk.group_id = group.id.clone();

    let processing_duration_ms = chunk
        .strategy_metadata
        .as_ref()
        .map(|m| m.processing_duration_ms)
        .unwrap_or(0);
    chunk.strategy_metadata = Some(StrategyMetadata {
        chunking_config: group.chunking_config.clone(),
        embedding_config: group.embedding_config.clone(),
        processed_at: now,
        processing_duration_ms,
    });
    chunk.updated_at = now;

    Ok(chunk)
}

/// Validate a whole batch up front. Nothing is returned unless every chunk
/// passes, and chunk ids must be unique within the batch.
pub fn prepare_batch(
    group: &ChunkEmbedGroup,
    chunks: Vec<ItemChunk>,
    now: DateTime<Utc>,
) -> Result<Vec<ItemChunk>> {
    let mut seen = HashSet::with_capacity(chunks.len());
    let mut prepared = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let chunk = prepare_chunk(group, chunk, now)?;
        if !seen.insert(chunk.id.clone()) {
            return Err(Error::Configuration(format!(
                "chunk id {} appears more than once in the batch",
                chunk.id
            )));
        }
        prepared.push(chunk);
    }
    Ok(prepared)
}

/// Order chunks of one item: by group, then position within the item.
pub fn sort_item_chunks(chunks: &mut [ItemChunk]) {
    chunks.sort_by(|a, b| {
        a.group_id
            .cmp(&b.group_id)
            .then(a.index.cmp(&b.index))
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}
