//! Group registry rules shared by every backend.
//!
//! Backends persist groups however they like, but creation, patching and
//! status changes all go through the functions here so that validation and
//! the status state machine behave identically everywhere.
//!
//! # Status machine
//!
//! ```text
//! WAIT_FOR_CHUNK_EMBED ──▶ PROCESSING ──▶ COMPLETED
//!          │                   │
//!          ├───────────────────┴────────▶ FAILED
//!          └──────────────────────────▶ COMPLETED
//! ```
//!
//! `COMPLETED` and `FAILED` are terminal; only deleting the group ends them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    ChunkEmbedGroup, ChunkingConfig, EmbeddingConfig, EmbeddingProvider, GroupStatus,
    GroupUpdate, NewGroup,
};

/// Largest vector width accepted for a group. Both the relational and the
/// search-engine backends can store vectors up to this size.
pub const MAX_DIMENSION: usize = 4096;

/// OpenAI embedding models and their native output width.
const OPENAI_MODELS: &[(&str, usize)] = &[
    ("text-embedding-3-small", 1536),
    ("text-embedding-3-large", 3072),
    ("text-embedding-ada-002", 1536),
];

pub fn validate_chunking(config: &ChunkingConfig) -> Result<()> {
    if config.max_tokens == 0 {
        return Err(Error::Configuration(
            "chunking_config.max_tokens must be > 0".to_string(),
        ));
    }
    if config.overlap_tokens >= config.max_tokens {
        return Err(Error::Configuration(format!(
            "chunking_config.overlap_tokens ({}) must be smaller than max_tokens ({})",
            config.overlap_tokens, config.max_tokens
        )));
    }
    Ok(())
}

pub fn validate_embedding(config: &EmbeddingConfig) -> Result<()> {
    if config.model.trim().is_empty() {
        return Err(Error::Configuration(
            "embedding_config.model must not be empty".to_string(),
        ));
    }
    if config.dimension == 0 || config.dimension > MAX_DIMENSION {
        return Err(Error::Configuration(format!(
            "embedding_config.dimension must be in 1..={}, got {}",
            MAX_DIMENSION, config.dimension
        )));
    }
    if config.batch_size == 0 {
        return Err(Error::Configuration(
            "embedding_config.batch_size must be > 0".to_string(),
        ));
    }
    if config.timeout_secs == 0 {
        return Err(Error::Configuration(
            "embedding_config.timeout_secs must be > 0".to_string(),
        ));
    }

    if config.provider == EmbeddingProvider::OpenAi {
        let native = OPENAI_MODELS
            .iter()
            .find(|(name, _)| *name == config.model)
            .map(|(_, dims)| *dims)
            .ok_or_else(|| {
                Error::Configuration(format!("unknown openai model '{}'", config.model))
            })?;
        // ada-002 cannot be shortened; the v3 models accept any smaller width.
        let fits = if config.model == "text-embedding-ada-002" {
            config.dimension == native
        } else {
            config.dimension <= native
        };
        if !fits {
            return Err(Error::Configuration(format!(
                "model '{}' cannot produce {}-dimensional embeddings (native width {})",
                config.model, config.dimension, native
            )));
        }
    }

    Ok(())
}

impl NewGroup {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("group name must not be empty".to_string()));
        }
        validate_chunking(&self.chunking_config)?;
        validate_embedding(&self.embedding_config)
    }

    /// Validate and turn into a fresh group in the initial status.
    pub fn into_group(self, now: DateTime<Utc>) -> Result<ChunkEmbedGroup> {
        self.validate()?;
        Ok(ChunkEmbedGroup {
            id: Uuid::new_v4().to_string(),
            name: self.name.trim().to_string(),
            description: self.description,
            chunking_config: self.chunking_config,
            embedding_config: self.embedding_config,
            is_default: self.is_default,
            is_active: self.is_active,
            status: GroupStatus::Pending,
            created_by: self.created_by,
            tags: self.tags,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Apply a patch to `group`. `chunk_count` is the number of chunks that
/// currently reference the group; a dimension change is refused while it
/// is non-zero.
pub fn apply_update(
    group: &ChunkEmbedGroup,
    update: GroupUpdate,
    chunk_count: u64,
    now: DateTime<Utc>,
) -> Result<ChunkEmbedGroup> {
    let mut next = group.clone();

    if let Some(name) = update.name {
        if name.trim().is_empty() {
            return Err(Error::Configuration("group name must not be empty".to_string()));
        }
        next.name = name.trim().to_string();
    }
    if let Some(description) = update.description {
        next.description = Some(description);
    }
    if let Some(chunking) = update.chunking_config {
        validate_chunking(&chunking)?;
        next.chunking_config = chunking;
    }
    if let Some(embedding) = update.embedding_config {
        validate_embedding(&embedding)?;
        if embedding.dimension != group.dimension() && chunk_count > 0 {
            return Err(Error::Configuration(format!(
                "dimension of group {} is fixed at {} while {} chunk(s) reference it; \
                 create a new group for a different embedding width",
                group.id,
                group.dimension(),
                chunk_count
            )));
        }
        next.embedding_config = embedding;
    }
    if let Some(is_default) = update.is_default {
        next.is_default = is_default;
    }
    if let Some(is_active) = update.is_active {
        next.is_active = is_active;
    }
    if let Some(tags) = update.tags {
        next.tags = tags;
    }

    next.updated_at = now;
    Ok(next)
}

impl GroupStatus {
    pub fn can_transition_to(self, to: GroupStatus) -> bool {
        use GroupStatus::*;
        self == to
            || matches!(
                (self, to),
                (Pending, Processing)
                    | (Pending, Completed)
                    | (Pending, Failed)
                    | (Processing, Completed)
                    | (Processing, Failed)
            )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::Completed | GroupStatus::Failed)
    }

    /// Status after a chunk lands: pending and processing groups become
    /// completed, terminal ones keep their status.
    pub fn after_insert(self) -> GroupStatus {
        match self {
            GroupStatus::Pending | GroupStatus::Processing => GroupStatus::Completed,
            other => other,
        }
    }
}

pub fn check_transition(from: GroupStatus, to: GroupStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidStatusTransition { from, to })
    }
}

/// Listing order for groups: creation time, then id.
pub fn sort_groups(groups: &mut [ChunkEmbedGroup]) {
    groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
