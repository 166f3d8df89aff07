//! PostgreSQL + pgvector [`ItemVectorStorage`] implementation.
//!
//! Groups live in `chunk_embed_groups`, chunks in `item_chunks` with an
//! unconstrained `vector` column. Each group gets a partial HNSW index over
//! `embedding::vector(D)` restricted to its own rows, so one table serves
//! groups of different widths. Cascade delete is a foreign key with
//! `ON DELETE CASCADE`; multi-statement writes run in one transaction.
//!
//! Index DDL runs `CONCURRENTLY` outside those transactions, so building or
//! dropping a group's index never blocks writes to other groups. A missing
//! index only costs speed: searches fall back to a sequential scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};

use item_vectors_core::chunk::{prepare_batch, prepare_chunk};
use item_vectors_core::models::{
    ChunkEmbedGroup, ChunkMetadata, ChunkView, ChunkingConfig, EmbeddingConfig, GroupDeletion,
    GroupList, GroupStatus, GroupUpdate, ItemChunk, NewGroup, RankedChunk, SearchQuery,
    StrategyMetadata,
};
use item_vectors_core::registry::{apply_update, check_transition};
use item_vectors_core::similarity::{finalize, validate_query};
use item_vectors_core::{Error, ItemVectorStorage, Result};

use crate::migrate::run_migrations;

/// pgvector refuses HNSW indexes on wider vectors.
const HNSW_MAX_DIMENSION: usize = 2000;

/// Default `hnsw.ef_search`: an index scan yields at most this many rows.
const HNSW_EF_SEARCH: usize = 40;

const GROUP_COLUMNS: &str = "id, name, description, chunking_config, embedding_config, \
     is_default, is_active, status, created_by, tags, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, item_id, group_id, title, content, chunk_index, \
     strategy_metadata, metadata, created_at, updated_at";

pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the group's ANN index. A failed build is logged and its
    /// invalid leftover dropped.
    async fn ensure_group_index(&self, group: &ChunkEmbedGroup) {
        let dimension = group.dimension();
        if dimension > HNSW_MAX_DIMENSION {
            warn!(
                group_id = %group.id,
                dimension,
                "dimension exceeds HNSW limit, searches on this group scan sequentially"
            );
            return;
        }
        let sql = create_index_sql(&group.id, dimension);
        match sqlx::raw_sql(&sql).execute(&self.pool).await {
            Ok(_) => debug!(group_id = %group.id, dimension, "group index ready"),
            Err(e) => {
                warn!(group_id = %group.id, error = %e, "could not build group index");
                self.drop_group_index(&group.id).await;
            }
        }
    }

    async fn drop_group_index(&self, group_id: &str) {
        let sql = drop_index_sql(group_id);
        if let Err(e) = sqlx::raw_sql(&sql).execute(&self.pool).await {
            warn!(group_id, error = %e, "could not drop group index");
        }
    }
}

/// `CREATE INDEX CONCURRENTLY` cannot run inside a transaction block.
fn create_index_sql(group_id: &str, dimension: usize) -> String {
    format!(
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON item_chunks \
         USING hnsw ((embedding::vector({})) vector_cosine_ops) \
         WHERE group_id = {}",
        index_name(group_id),
        dimension,
        quote_literal(group_id)
    )
}

fn drop_index_sql(group_id: &str) -> String {
    format!("DROP INDEX CONCURRENTLY IF EXISTS {}", index_name(group_id))
}

/// Map a driver error into the shared taxonomy. A foreign key violation
/// means the referenced group vanished between validation and write.
fn storage_err(err: sqlx::Error) -> Error {
    if let Some(db) = err.as_database_error() {
        if db.code().as_deref() == Some("23503") {
            return Error::NotFound(format!("group referenced by chunk: {}", db.message()));
        }
    }
    Error::storage(err)
}

/// Per-group index name. Group ids are arbitrary text, so anything outside
/// `[a-z0-9]` is folded to `_` and the result kept under the 63-byte limit.
fn index_name(group_id: &str) -> String {
    let cleaned: String = group_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(40)
        .collect();
    format!("idx_item_chunks_hnsw_{}", cleaned)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::Configuration(format!("{} out of range: {}", what, value)))
}

fn group_from_row(row: &PgRow) -> Result<ChunkEmbedGroup> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    let chunking: Json<ChunkingConfig> = row.try_get("chunking_config").map_err(storage_err)?;
    let embedding: Json<EmbeddingConfig> = row.try_get("embedding_config").map_err(storage_err)?;
    let tags: Json<Vec<String>> = row.try_get("tags").map_err(storage_err)?;

    Ok(ChunkEmbedGroup {
        id: row.try_get("id").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        description: row.try_get("description").map_err(storage_err)?,
        chunking_config: chunking.0,
        embedding_config: embedding.0,
        is_default: row.try_get("is_default").map_err(storage_err)?,
        is_active: row.try_get("is_active").map_err(storage_err)?,
        status: status.parse()?,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        tags: tags.0,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

fn view_from_row(row: &PgRow) -> Result<ChunkView> {
    let strategy: Json<StrategyMetadata> =
        row.try_get("strategy_metadata").map_err(storage_err)?;
    let metadata: Option<Json<ChunkMetadata>> = row.try_get("metadata").map_err(storage_err)?;

    Ok(ChunkView {
        id: row.try_get("id").map_err(storage_err)?,
        item_id: row.try_get("item_id").map_err(storage_err)?,
        group_id: row.try_get("group_id").map_err(storage_err)?,
        title: row.try_get("title").map_err(storage_err)?,
        content: row.try_get("content").map_err(storage_err)?,
        index: row.try_get("chunk_index").map_err(storage_err)?,
        strategy_metadata: Some(strategy.0),
        metadata: metadata.map(|m| m.0),
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

fn chunk_from_row(row: &PgRow) -> Result<ItemChunk> {
    let view = view_from_row(row)?;
    let embedding: Vector = row.try_get("embedding").map_err(storage_err)?;
    Ok(ItemChunk {
        id: view.id,
        item_id: view.item_id,
        group_id: view.group_id,
        title: view.title,
        content: view.content,
        index: view.index,
        embedding: embedding.to_vec(),
        strategy_metadata: view.strategy_metadata,
        metadata: view.metadata,
        created_at: view.created_at,
        updated_at: view.updated_at,
    })
}

/// Load a group and lock its row for the rest of the transaction.
async fn lock_group(
    conn: &mut PgConnection,
    group_id: &str,
    exclusive: bool,
) -> Result<Option<ChunkEmbedGroup>> {
    let sql = format!(
        "SELECT {} FROM chunk_embed_groups WHERE id = $1 FOR {}",
        GROUP_COLUMNS,
        if exclusive { "UPDATE" } else { "SHARE" }
    );
    let row = sqlx::query(&sql)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;
    row.as_ref().map(group_from_row).transpose()
}

/// Insert or overwrite a chunk. An id already stored under another group is
/// left untouched and reported as a configuration error.
async fn upsert_chunk(conn: &mut PgConnection, chunk: &ItemChunk) -> Result<()> {
    let strategy = chunk.strategy_metadata.as_ref().map(Json);
    let result = sqlx::query(
        r#"
        INSERT INTO item_chunks (id, item_id, group_id, title, content, chunk_index,
                                 dimension, embedding, strategy_metadata, metadata,
                                 created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT(id) DO UPDATE SET
            item_id = excluded.item_id,
            title = excluded.title,
            content = excluded.content,
            chunk_index = excluded.chunk_index,
            dimension = excluded.dimension,
            embedding = excluded.embedding,
            strategy_metadata = excluded.strategy_metadata,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at
        WHERE item_chunks.group_id = excluded.group_id
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.item_id)
    .bind(&chunk.group_id)
    .bind(&chunk.title)
    .bind(&chunk.content)
    .bind(chunk.index)
    .bind(to_i32(chunk.embedding.len(), "dimension")?)
    .bind(Vector::from(chunk.embedding.clone()))
    .bind(strategy)
    .bind(chunk.metadata.as_ref().map(Json))
    .bind(chunk.created_at)
    .bind(chunk.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    if result.rows_affected() > 0 {
        return Ok(());
    }

    let owner: Option<String> = sqlx::query_scalar("SELECT group_id FROM item_chunks WHERE id = $1")
        .bind(&chunk.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;
    Err(Error::chunk_in_other_group(
        &chunk.id,
        owner.as_deref().unwrap_or("unknown"),
    ))
}

async fn mark_inserted(conn: &mut PgConnection, group_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE chunk_embed_groups SET status = $2, updated_at = $3 \
         WHERE id = $1 AND status IN ($4, $5)",
    )
    .bind(group_id)
    .bind(GroupStatus::Completed.as_str())
    .bind(now)
    .bind(GroupStatus::Pending.as_str())
    .bind(GroupStatus::Processing.as_str())
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn write_group(conn: &mut PgConnection, group: &ChunkEmbedGroup) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE chunk_embed_groups SET
            name = $2, description = $3, chunking_config = $4, embedding_config = $5,
            dimension = $6, is_default = $7, is_active = $8, status = $9, tags = $10,
            updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(&group.id)
    .bind(&group.name)
    .bind(&group.description)
    .bind(Json(&group.chunking_config))
    .bind(Json(&group.embedding_config))
    .bind(to_i32(group.dimension(), "dimension")?)
    .bind(group.is_default)
    .bind(group.is_active)
    .bind(group.status.as_str())
    .bind(Json(&group.tags))
    .bind(group.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl ItemVectorStorage for PgVectorStore {
    async fn initialize(&self) -> Result<()> {
        run_migrations(&self.pool).await?;
        info!("postgres schema ready");
        Ok(())
    }

    async fn create_group(&self, new_group: NewGroup) -> Result<ChunkEmbedGroup> {
        let group = new_group.into_group(Utc::now())?;

        sqlx::query(
            r#"
            INSERT INTO chunk_embed_groups (id, name, description, chunking_config,
                                            embedding_config, dimension, is_default,
                                            is_active, status, created_by, tags,
                                            created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(Json(&group.chunking_config))
        .bind(Json(&group.embedding_config))
        .bind(to_i32(group.dimension(), "dimension")?)
        .bind(group.is_default)
        .bind(group.is_active)
        .bind(group.status.as_str())
        .bind(&group.created_by)
        .bind(Json(&group.tags))
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.ensure_group_index(&group).await;
        info!(group_id = %group.id, dimension = group.dimension(), "created group");
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> Result<ChunkEmbedGroup> {
        let sql = format!("SELECT {} FROM chunk_embed_groups WHERE id = $1", GROUP_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(row) => group_from_row(&row),
            None => Err(Error::group_not_found(group_id)),
        }
    }

    async fn list_groups(&self, item_id: Option<&str>) -> Result<GroupList> {
        let rows = match item_id {
            None => {
                let sql = format!(
                    "SELECT {} FROM chunk_embed_groups ORDER BY created_at, id",
                    GROUP_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
            Some(item_id) => {
                let sql = format!(
                    "SELECT {} FROM chunk_embed_groups g \
                     WHERE EXISTS (SELECT 1 FROM item_chunks c \
                                   WHERE c.group_id = g.id AND c.item_id = $1) \
                     ORDER BY created_at, id",
                    GROUP_COLUMNS
                );
                sqlx::query(&sql).bind(item_id).fetch_all(&self.pool).await
            }
        }
        .map_err(storage_err)?;

        let groups = rows
            .iter()
            .map(group_from_row)
            .collect::<Result<Vec<_>>>()?;
        let total_count = groups.len();
        Ok(GroupList {
            groups,
            total_count,
        })
    }

    async fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<ChunkEmbedGroup> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let current = lock_group(&mut tx, group_id, true)
            .await?
            .ok_or_else(|| Error::group_not_found(group_id))?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_chunks WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_err)?;

        let patched = apply_update(&current, update, count as u64, Utc::now())?;
        write_group(&mut tx, &patched).await?;

        tx.commit().await.map_err(storage_err)?;

        if patched.dimension() != current.dimension() {
            self.drop_group_index(group_id).await;
            self.ensure_group_index(&patched).await;
        }
        Ok(patched)
    }

    async fn delete_group(&self, group_id: &str) -> Result<GroupDeletion> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let deleted_chunk_count = match lock_group(&mut tx, group_id, true).await? {
            None => None,
            Some(_) => {
                let chunks = sqlx::query("DELETE FROM item_chunks WHERE group_id = $1")
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                sqlx::query("DELETE FROM chunk_embed_groups WHERE id = $1")
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                Some(chunks.rows_affected())
            }
        };
        tx.commit().await.map_err(storage_err)?;

        let deleted_chunk_count = match deleted_chunk_count {
            Some(count) => {
                self.drop_group_index(group_id).await;
                count
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
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut group = lock_group(&mut tx, group_id, true)
            .await?
            .ok_or_else(|| Error::group_not_found(group_id))?;
        check_transition(group.status, status)?;

        if group.status != status {
            group.status = status;
            group.updated_at = Utc::now();
            write_group(&mut tx, &group).await?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(group)
    }

    async fn insert_chunk(&self, group: &ChunkEmbedGroup, chunk: ItemChunk) -> Result<bool> {
        let now = Utc::now();
        let chunk = prepare_chunk(group, chunk, now)?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let stored = lock_group(&mut tx, &group.id, false)
            .await?
            .ok_or_else(|| Error::group_not_found(&group.id))?;
        let chunk = prepare_chunk(&stored, chunk, now)?;

        debug!(chunk_id = %chunk.id, group_id = %group.id, "insert chunk");
        upsert_chunk(&mut tx, &chunk).await?;
        mark_inserted(&mut tx, &group.id, now).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn batch_insert_chunks(
        &self,
        group: &ChunkEmbedGroup,
        chunks: Vec<ItemChunk>,
    ) -> Result<bool> {
        let now = Utc::now();
        let chunks = prepare_batch(group, chunks, now)?;
        if chunks.is_empty() {
            return Ok(true);
        }

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let stored = lock_group(&mut tx, &group.id, false)
            .await?
            .ok_or_else(|| Error::group_not_found(&group.id))?;
        let chunks = prepare_batch(&stored, chunks, now)?;

        debug!(group_id = %group.id, count = chunks.len(), "batch insert chunks");
        for chunk in &chunks {
            upsert_chunk(&mut tx, chunk).await?;
        }
        mark_inserted(&mut tx, &group.id, now).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn get_chunks_by_item_id(&self, item_id: &str) -> Result<Vec<ItemChunk>> {
        let sql = format!(
            "SELECT {}, embedding FROM item_chunks WHERE item_id = $1 \
             ORDER BY group_id, chunk_index, created_at, id",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(item_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn count_chunks(&self, group_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_chunks WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn delete_chunks_by_item_id(&self, item_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM item_chunks WHERE item_id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        let deleted = result.rows_affected();
        info!(item_id, deleted, "deleted chunks by item");
        Ok(deleted)
    }

    async fn delete_chunks_by_group_id(&self, group_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM item_chunks WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        let deleted = result.rows_affected();
        info!(group_id, deleted, "deleted chunks by group");
        Ok(deleted)
    }

    async fn search_chunks(&self, query: &SearchQuery) -> Result<Vec<RankedChunk>> {
        let group = self.get_group(&query.group_id).await?;
        validate_query(group.dimension(), query)?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let exact = !query.item_ids.is_empty()
            || query.filter.chunk_type.is_some()
            || query.top_k > HNSW_EF_SEARCH;
        let sql = search_sql(group.dimension(), exact);
        let limit = i64::try_from(query.top_k).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(Vector::from(query.vector.clone()))
            .bind(&query.group_id)
            .bind(&query.item_ids)
            .bind(query.filter.chunk_type.as_deref())
            .bind(query.threshold)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let hits = rows
            .iter()
            .map(|row| {
                Ok(RankedChunk {
                    chunk: view_from_row(row)?,
                    similarity: row.try_get("similarity").map_err(storage_err)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(group_id = %query.group_id, hits = hits.len(), "vector search");
        Ok(finalize(hits, query))
    }
}

/// k-NN statement for a group of width `dimension`. The cast matches the
/// expression of the group's partial HNSW index. pgvector yields NaN for a
/// zero vector, which scores as similarity 0 here.
///
/// An HNSW scan returns at most `ef_search` rows and applies the item and
/// chunk-type predicates afterwards, so narrowed or deep searches set
/// `exact`: the group's matching rows are materialized first and ranked
/// by a full scan.
fn search_sql(dimension: usize, exact: bool) -> String {
    let distance = format!(
        "(embedding::vector({d}) <=> $1::vector({d}))",
        d = dimension
    );
    let similarity = format!("(1 - COALESCE(NULLIF({}, 'NaN'::float8), 1))", distance);
    let predicates = "group_id = $2 \
           AND (cardinality($3::text[]) = 0 OR item_id = ANY($3)) \
           AND ($4::text IS NULL OR metadata->>'chunk_type' = $4)";
    if exact {
        format!(
            "WITH candidates AS MATERIALIZED ( \
               SELECT {cols}, embedding FROM item_chunks WHERE {pred} \
             ) \
             SELECT {cols}, {sim} AS similarity FROM candidates \
             WHERE {sim} >= $5 \
             ORDER BY {dist}, chunk_index, created_at, id \
             LIMIT $6",
            cols = CHUNK_COLUMNS,
            pred = predicates,
            sim = similarity,
            dist = distance
        )
    } else {
        format!(
            "SELECT {cols}, {sim} AS similarity FROM item_chunks \
             WHERE {pred} \
               AND {sim} >= $5 \
             ORDER BY {dist}, chunk_index, created_at, id \
             LIMIT $6",
            cols = CHUNK_COLUMNS,
            pred = predicates,
            sim = similarity,
            dist = distance
        )
    }
}
