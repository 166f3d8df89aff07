//! # Item Vectors Core
//!
//! Backend-independent logic for storing content chunks with dense
//! embeddings under named configuration groups and answering
//! nearest-neighbour queries over them.
//!
//! This crate contains no database drivers or HTTP clients. Concrete
//! backends (PostgreSQL + pgvector, Elasticsearch) live in the
//! `item-vectors` crate and implement [`store::ItemVectorStorage`]; the
//! [`store::memory::InMemoryStore`] here is the reference implementation.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Groups, chunks, queries and ranked results |
//! | [`error`] | Error taxonomy shared by all backends |
//! | [`registry`] | Group validation, patching and the status machine |
//! | [`chunk`] | Dimension checks and insert-time chunk preparation |
//! | [`similarity`] | Cosine similarity and deterministic ranking |
//! | [`store`] | The storage trait and the in-memory backend |

pub mod chunk;
pub mod error;
pub mod models;
pub mod registry;
pub mod similarity;
pub mod store;

#[cfg(any(test, feature = "conformance"))]
pub use store::conformance;

pub use error::{Error, Result};
pub use store::ItemVectorStorage;
