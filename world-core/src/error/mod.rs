//! Error taxonomy for world store operations
//!
//! - `SchemaViolation`: malformed key/row against a declared shape (programmer error)
//! - `DuplicateElement` / `ElementNotFound`: caller-logic errors on collections
//! - `CounterExhausted`: a counter scope can no longer issue ids
//! - `MoveConflict`: recoverable spatial move failure
//! - `UnknownEntity` / `InvalidTransition`: schema version registry misuse
//! - `IndexCorrupted`: stored index disagrees with its collection
//! - `Codec` / `Backend`: byte-level decoding and storage failures

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Schema violation on {table}: {reason}")]
    SchemaViolation { table: String, reason: String },

    #[error("Element {element} already present in {collection} for owner {owner}")]
    DuplicateElement {
        collection: String,
        owner: String,
        element: String,
    },

    #[error("Element {element} not found in {collection} for owner {owner}")]
    ElementNotFound {
        collection: String,
        owner: String,
        element: String,
    },

    #[error("Counter {scope} exhausted")]
    CounterExhausted { scope: String },

    #[error("Cannot move {element} on layer {layer}: already present at {to}")]
    MoveConflict {
        layer: String,
        element: String,
        to: String,
    },

    #[error("Unknown versioned entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid transition for {entity}: {reason}")]
    InvalidTransition { entity: String, reason: String },

    #[error("Index corrupted in {collection}: {reason}")]
    IndexCorrupted { collection: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::SchemaViolation {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn transition(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidTransition {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the caller's own request, as opposed to storage trouble.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StoreError::SchemaViolation { .. }
                | StoreError::DuplicateElement { .. }
                | StoreError::ElementNotFound { .. }
                | StoreError::MoveConflict { .. }
                | StoreError::UnknownEntity(_)
                | StoreError::InvalidTransition { .. }
        )
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
