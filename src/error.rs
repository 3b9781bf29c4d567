//! Error types for the host supervisor.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::jobs::JobKind;

/// Top-level error type for the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reading job definitions off disk.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host process lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Host executable not found at {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Failed to stage binaries for {name}: {reason}")]
    Staging { name: String, reason: String },

    #[error("Failed to spawn host for {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Host for {name} did not stop within {grace:?}")]
    StopTimeout { name: String, grace: Duration },

    #[error("Runner for {name} has been shut down")]
    ShutDown { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invoke/poll protocol errors, surfaced to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("Function {function} not found in job {job}")]
    FunctionNotFound { job: String, function: String },

    #[error("Host configuration for job {job} not found")]
    HostConfigNotFound { job: String },

    #[error("Host configuration for job {job} has no id")]
    MissingHostId { job: String },

    #[error("{kind} jobs cannot be invoked")]
    NotSupported { kind: JobKind },

    #[error("Failed to enqueue invocation {id}: {reason}")]
    EnqueueFailed { id: Uuid, reason: String },

    #[error("Failed to read status {key}: {reason}")]
    StatusReadFailed { key: String, reason: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable queue/blob collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Queue {0} does not exist")]
    QueueMissing(String),

    #[error("Invalid storage name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem watcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Watch root {0} does not exist")]
    RootMissing(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Result type alias for the supervisor.
pub type Result<T> = std::result::Result<T, Error>;
