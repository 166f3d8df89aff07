//! Error taxonomy shared by every storage backend.
//!
//! Each variant maps to one caller-visible failure class. Adapters translate
//! their driver errors into [`Error::Storage`]; the remaining variants are
//! raised by validation in this crate and surface unchanged regardless of
//! which backend is in use.

use thiserror::Error;

use crate::models::GroupStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid group configuration, rejected before anything is persisted.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Embedding length differs from the group's declared dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: GroupStatus, to: GroupStatus },

    /// Backend connectivity or transaction failure. Never retried here.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }

    pub fn group_not_found(group_id: &str) -> Self {
        Error::NotFound(format!("group {}", group_id))
    }

    /// A chunk id is bound to the group it was first written to.
    pub fn chunk_in_other_group(chunk_id: &str, owner_group_id: &str) -> Self {
        Error::Configuration(format!(
            "chunk {} already belongs to group {}",
            chunk_id, owner_group_id
        ))
    }

    /// True when the failure was caused by the caller's input rather than
    /// the backend, i.e. it should map to a client-fault response.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::DimensionMismatch { .. }
                | Error::InvalidStatusTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message_carries_both_lengths() {
        let err = Error::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Embedding dimension mismatch: expected 4, got 3"
        );
    }

    #[test]
    fn test_client_fault_classification() {
        assert!(Error::Configuration("x".into()).is_client_fault());
        assert!(Error::DimensionMismatch {
            expected: 1,
            actual: 2
        }
        .is_client_fault());
        assert!(!Error::NotFound("x".into()).is_client_fault());
        assert!(Error::chunk_in_other_group("c1", "g1").is_client_fault());
        assert!(!Error::storage("connection reset").is_client_fault());
    }
}
