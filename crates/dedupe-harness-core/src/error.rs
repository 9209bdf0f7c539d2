//! Error taxonomy for duplicate detection and merge lifecycle.
//!
//! Expected failures (`NotFound`, `InvalidState`, `SequentialUndoRequired`,
//! `InvalidInput`) are turned into `success = false` outcomes by the service layer; the rest
//! propagate as hard errors.

use std::fmt;

use thiserror::Error;

use crate::models::MergeOperation;

/// External collaborator whose call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSystem {
    EmbeddingProvider,
    ContentSource,
    StorageBackend,
    DocumentStore,
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExternalSystem::EmbeddingProvider => "embedding provider",
            ExternalSystem::ContentSource => "content source",
            ExternalSystem::StorageBackend => "storage backend",
            ExternalSystem::DocumentStore => "document store",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DedupeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Undo refused because later merges on the same target are still live.
    /// `blocking` is the most recent of them, the one to undo first.
    #[error("undo blocked: merge {} must be undone first", blocking.id)]
    SequentialUndoRequired { blocking: Box<MergeOperation> },

    #[error("{system} failure: {message}")]
    ExternalSystemFailure {
        system: ExternalSystem,
        message: String,
    },

    /// The primary mutation happened; the listed bookkeeping steps did not.
    #[error("operation succeeded with warnings: {}", warnings.join("; "))]
    PartialFailure { warnings: Vec<String> },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DedupeError {
    pub fn external(system: ExternalSystem, err: impl fmt::Display) -> Self {
        DedupeError::ExternalSystemFailure {
            system,
            message: err.to_string(),
        }
    }

    /// Short machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DedupeError::NotFound(_) => "not_found",
            DedupeError::InvalidState(_) => "invalid_state",
            DedupeError::SequentialUndoRequired { .. } => "sequential_undo_required",
            DedupeError::ExternalSystemFailure { .. } => "external_system_failure",
            DedupeError::PartialFailure { .. } => "partial_failure",
            DedupeError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Whether this is an expected outcome rather than an infrastructure fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            DedupeError::NotFound(_)
                | DedupeError::InvalidState(_)
                | DedupeError::SequentialUndoRequired { .. }
                | DedupeError::InvalidInput(_)
        )
    }
}

pub type DedupeResult<T> = std::result::Result<T, DedupeError>;
