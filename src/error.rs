//! Error types for the catalog store.

use thiserror::Error;

/// Main error type for catalog operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing node registration")]
    MissingNode,

    #[error("Missing service registration")]
    MissingService,

    #[error("Node name {name} is reserved by node {existing_id} with name {existing_name}")]
    NodeNameConflict {
        name: String,
        existing_id: String,
        existing_name: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Check node {check_node:?} does not match node {node:?}")]
    CheckNodeMismatch { check_node: String, node: String },

    #[error("Unique constraint violated on {table}.{index}")]
    UniqueViolation {
        table: &'static str,
        index: &'static str,
    },

    #[error("Unknown index {table}.{index}")]
    UnknownIndex { table: &'static str, index: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, StoreError>;
