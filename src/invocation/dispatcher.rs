//! Invoke a function through the host's durable queue and poll its status.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::message::InvocationMessage;
use super::storage::{BlobStore, QueueClient};
use crate::config::{DEFAULT_QUEUE_PREFIX, DEFAULT_STATUS_CONTAINER};
use crate::error::InvocationError;
use crate::jobs::JobStore;
use crate::jobs::model::function_id;

/// `<prefix>-<hostId>`.
pub fn queue_name(prefix: &str, host_id: &str) -> String {
    format!("{prefix}-{host_id}")
}

/// `invocations/<hostId>/Host.Functions.<fn>/<id>`.
pub fn status_key(host_id: &str, function_name: &str, id: Uuid) -> String {
    format!(
        "invocations/{host_id}/{}/{id}",
        function_id(function_name)
    )
}

/// Fire-and-forget invocation with status polling by correlation id.
pub struct InvocationDispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueClient>,
    blobs: Arc<dyn BlobStore>,
    queue_prefix: String,
    status_container: String,
}

impl InvocationDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueClient>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            store,
            queue,
            blobs,
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            status_container: DEFAULT_STATUS_CONTAINER.to_string(),
        }
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_status_container(mut self, container: impl Into<String>) -> Self {
        self.status_container = container.into();
        self
    }

    /// Enqueue an invoke message and return its correlation id.
    ///
    /// Nothing is enqueued unless the function and the host id both resolve.
    pub async fn invoke(
        &self,
        job: &str,
        function: &str,
        payload: &str,
    ) -> Result<Uuid, InvocationError> {
        let config = self
            .store
            .read_function_config(job, function)
            .await?
            .ok_or_else(|| InvocationError::FunctionNotFound {
                job: job.to_string(),
                function: function.to_string(),
            })?;
        let host_id = self.host_id(job).await?;

        let queue = queue_name(&self.queue_prefix, &host_id);
        let message = InvocationMessage::new(function, config.input_argument_name(), payload);
        let id = message.id();
        let body = message.to_json()?;

        let enqueue_failed = |e: crate::error::StorageError| InvocationError::EnqueueFailed {
            id,
            reason: e.to_string(),
        };
        self.queue.ensure_queue(&queue).await.map_err(enqueue_failed)?;
        self.queue
            .enqueue(&queue, &body)
            .await
            .map_err(enqueue_failed)?;

        info!(
            job = %job,
            function = %function,
            id = %id,
            queue = %queue,
            "Invocation enqueued"
        );
        Ok(id)
    }

    /// Raw status record for an invocation, or `None` while the host has
    /// not written one.
    pub async fn get_status(
        &self,
        job: &str,
        function: &str,
        id: Uuid,
    ) -> Result<Option<String>, InvocationError> {
        let host_id = self.host_id(job).await?;
        let key = status_key(&host_id, function, id);

        let content = self
            .blobs
            .read(&self.status_container, &key)
            .await
            .map_err(|e| InvocationError::StatusReadFailed {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        debug!(key = %key, found = content.is_some(), "Status read");
        Ok(content.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn host_id(&self, job: &str) -> Result<String, InvocationError> {
        let host = self
            .store
            .read_host_config(job)
            .await?
            .ok_or_else(|| InvocationError::HostConfigNotFound {
                job: job.to_string(),
            })?;
        host.id()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| InvocationError::MissingHostId {
                job: job.to_string(),
            })
    }
}
