//! Backend selection: turn a [`Config`] into a ready storage handle.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use item_vectors_core::store::memory::InMemoryStore;
use item_vectors_core::ItemVectorStorage;

use crate::config::{Backend, Config};
use crate::db;
use crate::es_store::ElasticStore;
use crate::pg_store::PgVectorStore;

/// Build the configured backend and run its idempotent bootstrap.
pub async fn open_storage(config: &Config) -> Result<Arc<dyn ItemVectorStorage>> {
    let storage: Arc<dyn ItemVectorStorage> = match config.storage.backend {
        Backend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("[postgres] section required for postgres backend")?;
            Arc::new(PgVectorStore::new(db::connect(pg).await?))
        }
        Backend::Elasticsearch => {
            let es = config
                .elasticsearch
                .as_ref()
                .context("[elasticsearch] section required for elasticsearch backend")?;
            Arc::new(ElasticStore::new(es)?)
        }
        Backend::Memory => Arc::new(InMemoryStore::new()),
    };

    storage
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize {} backend", config.storage.backend.as_str()))?;
    info!(backend = config.storage.backend.as_str(), "storage ready");
    Ok(storage)
}
