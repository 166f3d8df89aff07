//! TOML configuration: backend selection and connection settings.
//!
//! ```toml
//! [storage]
//! backend = "postgres"          # postgres | elasticsearch | memory
//!
//! [postgres]
//! url = "postgres://localhost/ivec"
//! max_connections = 5
//!
//! [elasticsearch]
//! url = "http://localhost:9200"
//! index_prefix = "item-vectors"
//! timeout_secs = 30
//! num_candidates = 100
//! username = "elastic"          # password from ELASTICSEARCH_PASSWORD
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    Elasticsearch,
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Elasticsearch => "elasticsearch",
            Backend::Memory => "memory",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: Backend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    pub url: String,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,
    #[serde(default)]
    pub username: Option<String>,
}

fn default_index_prefix() -> String {
    "item-vectors".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_num_candidates() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.storage.backend {
        Backend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[postgres] section required for postgres backend"))?;
            if !(pg.url.starts_with("postgres://") || pg.url.starts_with("postgresql://")) {
                anyhow::bail!("postgres.url must be a postgres:// connection string");
            }
            if pg.max_connections == 0 {
                anyhow::bail!("postgres.max_connections must be > 0");
            }
        }
        Backend::Elasticsearch => {
            let es = config.elasticsearch.as_ref().ok_or_else(|| {
                anyhow::anyhow!("[elasticsearch] section required for elasticsearch backend")
            })?;
            if !(es.url.starts_with("http://") || es.url.starts_with("https://")) {
                anyhow::bail!("elasticsearch.url must be an http(s) URL");
            }
            if es.index_prefix.is_empty()
                || es.index_prefix != es.index_prefix.to_lowercase()
                || es.index_prefix.contains(['*', ',', ' ', '/', '\\', '?', '"', '<', '>', '|'])
            {
                anyhow::bail!(
                    "elasticsearch.index_prefix must be a non-empty lowercase index name, got '{}'",
                    es.index_prefix
                );
            }
            if es.timeout_secs == 0 {
                anyhow::bail!("elasticsearch.timeout_secs must be > 0");
            }
            if es.num_candidates == 0 || es.num_candidates > 10_000 {
                anyhow::bail!("elasticsearch.num_candidates must be in 1..=10000");
            }
        }
        Backend::Memory => {}
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_needs_no_sections() {
        let config = parse_config("[storage]\nbackend = \"memory\"\n").unwrap();
        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_postgres_defaults() {
        let config = parse_config(
            r#"
[storage]
backend = "postgres"

[postgres]
url = "postgres://localhost/ivec"
"#,
        )
        .unwrap();
        assert_eq!(config.postgres.unwrap().max_connections, 5);
    }

    #[test]
    fn test_postgres_section_required() {
        let err = parse_config("[storage]\nbackend = \"postgres\"\n").unwrap_err();
        assert!(err.to_string().contains("[postgres]"));
    }

    #[test]
    fn test_elasticsearch_validation() {
        let ok = parse_config(
            r#"
[storage]
backend = "elasticsearch"

[elasticsearch]
url = "http://localhost:9200"
"#,
        )
        .unwrap();
        let es = ok.elasticsearch.unwrap();
        assert_eq!(es.index_prefix, "item-vectors");
        assert_eq!(es.num_candidates, 100);

        let bad_prefix = parse_config(
            r#"
[storage]
backend = "elasticsearch"

[elasticsearch]
url = "http://localhost:9200"
index_prefix = "Vectors"
"#,
        );
        assert!(bad_prefix.is_err());

        let bad_url = parse_config(
            r#"
[storage]
backend = "elasticsearch"

[elasticsearch]
url = "localhost:9200"
"#,
        );
        assert!(bad_url.is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(parse_config("[storage]\nbackend = \"redis\"\n").is_err());
    }
}
