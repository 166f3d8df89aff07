//! # item-vectors
//!
//! Deployment crate for chunk and embedding storage. The backend-independent
//! model, validation rules and similarity engine live in
//! [`item_vectors_core`]; this crate adds the concrete backends, their
//! configuration, and the `ivec` admin CLI.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌───────────────────────┐
//!   ivec / host ─▶│  dyn ItemVectorStorage │
//!                 └───────────┬───────────┘
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!   ┌─────────────┐   ┌───────────────┐   ┌───────────┐
//!   │ PostgreSQL  │   │ Elasticsearch │   │ In-memory │
//!   │  pgvector   │   │ dense_vector  │   │ (tests)   │
//!   └─────────────┘   └───────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`backend`] | Build the configured backend as `Arc<dyn ItemVectorStorage>` |
//! | [`db`] | PostgreSQL connection pool |
//! | [`migrate`] | PostgreSQL schema bootstrap |
//! | [`pg_store`] | Relational adapter (sqlx + pgvector) |
//! | [`es_store`] | Search-engine adapter (Elasticsearch REST) |
//! | [`commands`] | `ivec` command implementations |

pub mod backend;
pub mod commands;
pub mod config;
pub mod db;
pub mod es_store;
pub mod migrate;
pub mod pg_store;
