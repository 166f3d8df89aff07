//! Core data models: configuration groups, chunks, and search results.
//!
//! A [`ChunkEmbedGroup`] binds one chunking strategy to one embedding model
//! and fixes the vector dimension of every [`ItemChunk`] stored under it.
//! Read paths hand out [`ChunkView`]s, which carry everything except the
//! embedding itself.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// How the chunking collaborator splits an item's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    Paragraph,
    FixedSize,
    Sentence,
}

/// Parameters handed to the chunker. Stored with the group and copied into
/// every chunk's [`StrategyMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Upper bound on a chunk's size, in tokens. Must be positive.
    pub max_tokens: usize,
    /// Tokens shared by consecutive chunks. Must be below `max_tokens`.
    #[serde(default)]
    pub overlap_tokens: usize,
}

/// Service that turns chunk text into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingProvider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "local")]
    Local,
}

impl EmbeddingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProvider::OpenAi => "openai",
            EmbeddingProvider::Ollama => "ollama",
            EmbeddingProvider::Local => "local",
        }
    }
}

/// Embedding model settings. `dimension` is the width every vector in the
/// group must have; the remaining fields are consumed by the embedding
/// collaborator, not by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    #[serde(alias = "dims")]
    pub dimension: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Aggregate ingestion status of a group.
///
/// `Pending` is persisted as `WAIT_FOR_CHUNK_EMBED`; `PENDING` is accepted
/// on input as a synonym.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupStatus {
    #[serde(rename = "WAIT_FOR_CHUNK_EMBED", alias = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "WAIT_FOR_CHUNK_EMBED",
            GroupStatus::Processing => "PROCESSING",
            GroupStatus::Completed => "COMPLETED",
            GroupStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAIT_FOR_CHUNK_EMBED" | "PENDING" => Ok(GroupStatus::Pending),
            "PROCESSING" => Ok(GroupStatus::Processing),
            "COMPLETED" => Ok(GroupStatus::Completed),
            "FAILED" => Ok(GroupStatus::Failed),
            other => Err(Error::Storage(format!("unknown group status '{}'", other))),
        }
    }
}

/// A named, versioned chunking + embedding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEmbedGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub chunking_config: ChunkingConfig,
    pub embedding_config: EmbeddingConfig,
    pub is_default: bool,
    pub is_active: bool,
    pub status: GroupStatus,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkEmbedGroup {
    pub fn dimension(&self) -> usize {
        self.embedding_config.dimension
    }
}

/// Input to `create_group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub chunking_config: ChunkingConfig,
    pub embedding_config: EmbeddingConfig,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update for an existing group. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub chunking_config: Option<ChunkingConfig>,
    pub embedding_config: Option<EmbeddingConfig>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
    pub tags: Option<Vec<String>>,
}

/// Result of listing groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupList {
    /// Oldest first; groups created at the same instant are ordered by id.
    pub groups: Vec<ChunkEmbedGroup>,
    /// Always `groups.len()`; there is no paging.
    pub total_count: usize,
}

/// Result of deleting a group. Deleting an unknown group is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDeletion {
    /// The id that was asked for, whether or not it existed.
    pub deleted_group_id: String,
    /// Chunks removed along with the group; 0 for an unknown group.
    pub deleted_chunk_count: u64,
}

/// Snapshot of the group configuration a chunk was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub chunking_config: ChunkingConfig,
    pub embedding_config: EmbeddingConfig,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub processing_duration_ms: u64,
}

/// Optional descriptive fields of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Free-form kind such as `prose` or `table`; the only field searches
    /// can filter on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    /// Character offset of the chunk's first character in the item text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<u64>,
    /// Character offset one past the chunk's last character.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u64>,
}

/// One embedded unit of content, as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChunk {
    /// Unique across all groups. Once written, the id stays with its group
    /// until that group is deleted.
    pub id: String,
    /// The source document this chunk was cut from.
    pub item_id: String,
    /// Set by the store on insert.
    pub group_id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    /// Position within the item; also breaks similarity ties in search.
    pub index: i64,
    /// Must have exactly the owning group's dimension.
    pub embedding: Vec<f32>,
    /// Set by the store on insert.
    #[serde(default)]
    pub strategy_metadata: Option<StrategyMetadata>,
    #[serde(default)]
    pub metadata: Option<ChunkMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemChunk {
    /// Build a chunk with a fresh UUID. `group_id` and `strategy_metadata`
    /// are filled in by the store when the chunk is inserted.
    pub fn new(
        item_id: impl Into<String>,
        index: i64,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            item_id: item_id.into(),
            group_id: String::new(),
            title: String::new(),
            content: content.into(),
            index,
            embedding,
            strategy_metadata: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn view(&self) -> ChunkView {
        ChunkView {
            id: self.id.clone(),
            item_id: self.item_id.clone(),
            group_id: self.group_id.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            index: self.index,
            strategy_metadata: self.strategy_metadata.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A chunk without its embedding, as returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkView {
    pub id: String,
    pub item_id: String,
    pub group_id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    pub index: i64,
    #[serde(default)]
    pub strategy_metadata: Option<StrategyMetadata>,
    #[serde(default)]
    pub metadata: Option<ChunkMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    #[serde(flatten)]
    pub chunk: ChunkView,
    /// Cosine similarity, `1 - cosine distance`.
    pub similarity: f64,
}

/// Exact-match predicates over chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFilter {
    #[serde(default)]
    pub chunk_type: Option<String>,
}

impl ChunkFilter {
    pub fn chunk_type(chunk_type: impl Into<String>) -> Self {
        Self {
            chunk_type: Some(chunk_type.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_type.is_none()
    }

    pub fn matches(&self, metadata: Option<&ChunkMetadata>) -> bool {
        match &self.chunk_type {
            None => true,
            Some(wanted) => metadata
                .and_then(|m| m.chunk_type.as_deref())
                .is_some_and(|t| t == wanted),
        }
    }
}

/// Nearest-neighbor query scoped to one group.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Items to search within; empty means every item in the group.
    pub item_ids: Vec<String>,
    pub group_id: String,
    pub vector: Vec<f32>,
    pub top_k: usize,
    /// Minimum similarity a chunk needs to be returned.
    pub threshold: f64,
    pub filter: ChunkFilter,
}

impl SearchQuery {
    pub fn new(group_id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            item_ids: Vec::new(),
            group_id: group_id.into(),
            vector,
            top_k: 10,
            threshold: 0.0,
            filter: ChunkFilter::default(),
        }
    }

    pub fn items<I, S>(mut self, item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_ids = item_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn filter(mut self, filter: ChunkFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn includes_item(&self, item_id: &str) -> bool {
        self.item_ids.is_empty() || self.item_ids.iter().any(|i| i == item_id)
    }
}
