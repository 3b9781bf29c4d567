//! Jobs manager with one entry point per job kind.
//!
//! Continuous jobs are supervised and invocable; triggered jobs are only
//! listed.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{InvocationError, JobError};
use crate::invocation::{BlobStore, InvocationDispatcher, QueueClient};
use crate::jobs::{FileJobStore, JobDefinition, JobKind, JobStore};
use crate::process::{ProcessRunnerFactory, RunnerFactory, RunnerOptions};
use crate::supervisor::{ContinuousJobSupervisor, JobStatus};
use crate::watcher::WatchOptions;

/// A job definition together with its runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: JobDefinition,
    /// `None` for kinds the manager does not run.
    pub status: Option<JobStatus>,
}

/// Supervised continuous jobs plus their invocation protocol.
pub struct ContinuousJobs {
    store: Arc<dyn JobStore>,
    supervisor: Arc<ContinuousJobSupervisor>,
    dispatcher: InvocationDispatcher,
}

impl ContinuousJobs {
    pub fn new(
        store: Arc<dyn JobStore>,
        supervisor: Arc<ContinuousJobSupervisor>,
        dispatcher: InvocationDispatcher,
    ) -> Self {
        Self {
            store,
            supervisor,
            dispatcher,
        }
    }

    pub fn supervisor(&self) -> &Arc<ContinuousJobSupervisor> {
        &self.supervisor
    }

    /// Managed job with `is_in_place` set, as its runner sees it.
    async fn get_job(&self, name: &str) -> Result<Option<JobView>, JobError> {
        if !self.supervisor.manages(name) {
            return Ok(None);
        }
        let Some(mut job) = self.store.read_job(name).await? else {
            return Ok(None);
        };
        job.settings = job.settings.with_in_place();
        let status = self.supervisor.observe(name).await;
        Ok(Some(JobView { job, status }))
    }

    async fn list_jobs(&self) -> Result<Vec<JobView>, JobError> {
        let mut jobs = Vec::new();
        for name in self.supervisor.job_names() {
            if let Some(view) = self.get_job(&name).await? {
                jobs.push(view);
            }
        }
        Ok(jobs)
    }
}

/// Listing-only access to triggered jobs.
pub struct TriggeredJobs {
    store: Arc<dyn JobStore>,
}

impl TriggeredJobs {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobView>, JobError> {
        Ok(self
            .store
            .read_job(name)
            .await?
            .map(|job| JobView { job, status: None }))
    }

    async fn list_jobs(&self) -> Result<Vec<JobView>, JobError> {
        let mut jobs = Vec::new();
        for name in self.store.list_job_names().await? {
            if let Some(view) = self.get_job(&name).await? {
                jobs.push(view);
            }
        }
        Ok(jobs)
    }
}

/// Closed set of job kinds sharing `get_job`, `list_jobs` and `shutdown`.
pub enum JobsManager {
    Continuous(ContinuousJobs),
    Triggered(TriggeredJobs),
}

impl JobsManager {
    /// Wire up the file store, process runners, supervisor and dispatcher
    /// for continuous jobs. Call [`open`](Self::open) to start supervising.
    pub fn continuous(
        config: &SupervisorConfig,
        queue: Arc<dyn QueueClient>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(
            config.jobs_root.clone(),
            JobKind::Continuous,
        ));
        let runners: Arc<dyn RunnerFactory> = Arc::new(ProcessRunnerFactory::new(
            RunnerOptions::from_config(config),
        ));
        let supervisor = ContinuousJobSupervisor::new(
            store.clone(),
            runners,
            config.job_names.clone(),
            WatchOptions {
                debounce: config.debounce,
                poll_interval: config.watcher_poll_interval,
            },
        );
        let dispatcher = InvocationDispatcher::new(store.clone(), queue, blobs)
            .with_queue_prefix(config.queue_prefix.clone())
            .with_status_container(config.status_container.clone());

        Self::Continuous(ContinuousJobs::new(store, supervisor, dispatcher))
    }

    pub fn triggered(config: &SupervisorConfig) -> Self {
        Self::Triggered(TriggeredJobs::new(Arc::new(FileJobStore::new(
            config.jobs_root.clone(),
            JobKind::Triggered,
        ))))
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::Continuous(_) => JobKind::Continuous,
            Self::Triggered(_) => JobKind::Triggered,
        }
    }

    /// Start supervision. No-op for kinds that are not supervised.
    pub async fn open(&self) {
        if let Self::Continuous(jobs) = self {
            jobs.supervisor.open().await;
        }
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<JobView>, JobError> {
        match self {
            Self::Continuous(jobs) => jobs.get_job(name).await,
            Self::Triggered(jobs) => jobs.get_job(name).await,
        }
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobView>, JobError> {
        match self {
            Self::Continuous(jobs) => jobs.list_jobs().await,
            Self::Triggered(jobs) => jobs.list_jobs().await,
        }
    }

    pub async fn invoke(
        &self,
        job: &str,
        function: &str,
        payload: &str,
    ) -> Result<Uuid, InvocationError> {
        match self {
            Self::Continuous(jobs) => jobs.dispatcher.invoke(job, function, payload).await,
            Self::Triggered(_) => Err(InvocationError::NotSupported {
                kind: JobKind::Triggered,
            }),
        }
    }

    pub async fn get_status(
        &self,
        job: &str,
        function: &str,
        id: Uuid,
    ) -> Result<Option<String>, InvocationError> {
        match self {
            Self::Continuous(jobs) => jobs.dispatcher.get_status(job, function, id).await,
            Self::Triggered(_) => Err(InvocationError::NotSupported {
                kind: JobKind::Triggered,
            }),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Continuous(jobs) => jobs.supervisor.shutdown().await,
            Self::Triggered(_) => {}
        }
        info!(kind = %self.kind(), "Jobs manager shut down");
    }
}
