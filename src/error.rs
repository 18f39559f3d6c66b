//! Error types for the docmill runtime.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Database busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Admission-time errors. These are the only errors a submitter sees.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invalid request: {reason}")]
    Invalid { reason: String },

    #[error("Backlog full ({active}/{capacity} active jobs), retry after {retry_after:?}")]
    BacklogFull {
        active: u64,
        capacity: u64,
        retry_after: Duration,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Dispatch/worker errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Fatal pipeline error for job {id}: {reason}")]
    Fatal { id: Uuid, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Retry orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Session {id} not found")]
    SessionNotFound { id: Uuid },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Artifact management errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Path {path} escapes the job artifact root")]
    PathEscape { path: String },

    #[error("Artifact not found: {path}")]
    NotFound { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
