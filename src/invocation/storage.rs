//! Durable queue and blob collaborators used by the invocation protocol.
//!
//! The host on the other side dequeues invoke messages and writes one status
//! blob per correlation id; the supervisor only enqueues and reads.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// Named durable queues.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create the queue if it does not exist yet.
    async fn ensure_queue(&self, name: &str) -> Result<(), StorageError>;

    /// Append a message. The queue must already exist.
    async fn enqueue(&self, name: &str, message: &str) -> Result<(), StorageError>;
}

/// Read access to `container/key` blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Blob content, or `None` when absent.
    async fn read(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

// ── In-memory ───────────────────────────────────────────────────────────

/// In-process queues and blobs. Contents are lost with the value.
#[derive(Default)]
pub struct MemoryStorage {
    queues: RwLock<HashMap<String, VecDeque<String>>>,
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a blob, as the host does when it records an invocation's status.
    pub async fn put_blob(&self, container: &str, key: &str, content: impl Into<Vec<u8>>) {
        self.blobs
            .write()
            .await
            .insert((container.to_string(), key.to_string()), content.into());
    }

    /// Pop the oldest message of a queue.
    pub async fn dequeue(&self, name: &str) -> Option<String> {
        self.queues.write().await.get_mut(name)?.pop_front()
    }

    /// Snapshot of a queue's pending messages, oldest first.
    pub async fn messages(&self, name: &str) -> Vec<String> {
        self.queues
            .read()
            .await
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }
}

#[async_trait]
impl QueueClient for MemoryStorage {
    async fn ensure_queue(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        self.queues
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn enqueue(&self, name: &str, message: &str) -> Result<(), StorageError> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| StorageError::QueueMissing(name.to_string()))?;
        queue.push_back(message.to_string());
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn read(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .blobs
            .read()
            .await
            .get(&(container.to_string(), key.to_string()))
            .cloned())
    }
}

// ── Directory-backed ────────────────────────────────────────────────────

/// Queues and blobs stored under a local directory:
///
/// ```text
/// <root>/queues/<queue>/<nanos>-<uuid>.json
/// <root>/blobs/<container>/<key>
/// ```
///
/// Message files sort in enqueue order.
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.root.join("queues").join(name))
    }

    fn blob_path(&self, container: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_name(container)?;
        let key_path = Path::new(key);
        let plain = !key.is_empty()
            && key_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StorageError::InvalidName(key.to_string()));
        }
        Ok(self.root.join("blobs").join(container).join(key_path))
    }

    /// Write a blob, creating parent directories.
    pub async fn put_blob(
        &self,
        container: &str,
        key: &str,
        content: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.blob_path(container, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, content).await
    }

    /// Message contents of a queue, oldest first.
    pub async fn messages(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.queue_dir(name)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::QueueMissing(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let mut messages = Vec::with_capacity(files.len());
        for file in files {
            messages.push(tokio::fs::read_to_string(file).await?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl QueueClient for DirectoryStorage {
    async fn ensure_queue(&self, name: &str) -> Result<(), StorageError> {
        let dir = self.queue_dir(name)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn enqueue(&self, name: &str, message: &str) -> Result<(), StorageError> {
        let dir = self.queue_dir(name)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(StorageError::QueueMissing(name.to_string()));
        }
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = dir.join(format!("{nanos:020}-{}.json", Uuid::new_v4()));
        write_atomic(&path, message.as_bytes()).await?;
        debug!(queue = %name, path = %path.display(), "Message enqueued");
        Ok(())
    }
}

#[async_trait]
impl BlobStore for DirectoryStorage {
    async fn read(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.blob_path(container, key)?;
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Queue and container names are single path segments.
fn validate_name(name: &str) -> Result<(), StorageError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// Write to a sibling temp file, then rename into place.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
