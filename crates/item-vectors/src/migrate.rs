use sqlx::PgPool;

use item_vectors_core::{Error, Result};

/// Create the pgvector extension, tables and indexes. Idempotent.
///
/// `item_chunks.embedding` is an unconstrained `vector` so groups of
/// different widths can share the table; the `dimension` column and its
/// CHECK pin every row to the width of its group.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let statements = [
        "CREATE EXTENSION IF NOT EXISTS vector",
        r#"
        CREATE TABLE IF NOT EXISTS chunk_embed_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            chunking_config JSONB NOT NULL,
            embedding_config JSONB NOT NULL,
            dimension INTEGER NOT NULL CHECK (dimension > 0),
            is_default BOOLEAN NOT NULL DEFAULT FALSE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            status TEXT NOT NULL,
            created_by TEXT,
            tags JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS item_chunks (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            group_id TEXT NOT NULL REFERENCES chunk_embed_groups(id) ON DELETE CASCADE,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            chunk_index BIGINT NOT NULL,
            dimension INTEGER NOT NULL,
            embedding vector NOT NULL,
            strategy_metadata JSONB NOT NULL,
            metadata JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            CHECK (vector_dims(embedding) = dimension)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_item_chunks_item_id ON item_chunks(item_id)",
        "CREATE INDEX IF NOT EXISTS idx_item_chunks_group_index ON item_chunks(group_id, chunk_index)",
        "CREATE INDEX IF NOT EXISTS idx_groups_created_at ON chunk_embed_groups(created_at, id)",
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(Error::storage)?;
    }

    Ok(())
}
