//! Continuous job supervisor.
//!
//! One [`RuntimeState`] per managed job name, each behind its own async
//! mutex. Every transition is a read-decide-act sequence run under that
//! lock, so concurrent change notifications and shutdown serialize per job:
//!
//! ```text
//!            job valid, start ok
//!   Stopped ─────────────────────▶ Running
//!      ▲  ▲                          │  │
//!      │  └──── job absent ──────────┘  │ invalid / start failed / crashed
//!      │                                ▼
//!      └──────── job absent ─────────  Error
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::jobs::store::files;
use crate::jobs::{JobDefinition, JobSettings, JobStore};
use crate::process::{JobRunner, RunnerFactory};
use crate::watcher::{ChangeCallback, ChangeWatcher, NamesToWatch, WatchOptions};

/// Lifecycle phase of a supervised job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// No process.
    Stopped,
    /// Host process alive.
    Running,
    /// Definition invalid or the host failed; no process.
    Error,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a job's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub error: Option<String>,
    /// When the current phase was entered.
    pub since: DateTime<Utc>,
}

/// Runtime state of one job. Only the supervisor touches it.
struct RuntimeState {
    phase: JobPhase,
    last_error: Option<String>,
    runner: Option<Box<dyn JobRunner>>,
    /// Set when a runner is created, cleared by the next refresh.
    first_observation: bool,
    since: DateTime<Utc>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            phase: JobPhase::Stopped,
            last_error: None,
            runner: None,
            first_observation: false,
            since: Utc::now(),
        }
    }

    fn status(&self) -> JobStatus {
        JobStatus {
            phase: self.phase,
            error: self.last_error.clone(),
            since: self.since,
        }
    }

    fn enter(&mut self, job: &str, phase: JobPhase, error: Option<String>) {
        if self.phase != phase {
            info!(job = %job, from = %self.phase, to = %phase, "Job phase changed");
            self.since = Utc::now();
        }
        self.phase = phase;
        self.last_error = error;
    }

    fn set_running(&mut self, job: &str) {
        self.enter(job, JobPhase::Running, None);
    }

    fn set_stopped(&mut self, job: &str) {
        self.enter(job, JobPhase::Stopped, None);
    }

    /// Error always carries its reason.
    fn set_error(&mut self, job: &str, error: String) {
        warn!(job = %job, error = %error, "Job in error");
        self.enter(job, JobPhase::Error, Some(error));
    }

    /// Stop and drop the runner, if any.
    async fn release(&mut self, job: &str, is_shutdown: bool) {
        if let Some(mut runner) = self.runner.take() {
            if let Err(e) = runner.stop(is_shutdown).await {
                warn!(job = %job, "Stopping host: {e}");
            }
            runner.dispose().await;
        }
        self.first_observation = false;
    }
}

/// Drives host processes from job definitions on disk.
pub struct ContinuousJobSupervisor {
    store: Arc<dyn JobStore>,
    runners: Arc<dyn RunnerFactory>,
    watch_options: WatchOptions,
    states: HashMap<String, Arc<Mutex<RuntimeState>>>,
    watchers: std::sync::Mutex<Vec<ChangeWatcher>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl ContinuousJobSupervisor {
    /// Create a supervisor for a fixed set of job names. Nothing runs until
    /// [`open`](Self::open).
    pub fn new(
        store: Arc<dyn JobStore>,
        runners: Arc<dyn RunnerFactory>,
        job_names: impl IntoIterator<Item = String>,
        watch_options: WatchOptions,
    ) -> Arc<Self> {
        let states = job_names
            .into_iter()
            .map(|name| (name, Arc::new(Mutex::new(RuntimeState::new()))))
            .collect();
        Arc::new(Self {
            store,
            runners,
            watch_options,
            states,
            watchers: std::sync::Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Managed job names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.states.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn manages(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Watchers subscribed and not yet stopped.
    pub fn active_watchers(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|w| !w.is_stopped())
            .count()
    }

    /// Subscribe a watcher per job and evaluate every job once.
    pub async fn open(self: &Arc<Self>) {
        if self.is_closed() || self.opened.swap(true, Ordering::SeqCst) {
            return;
        }

        let relevant: HashSet<String> = [files::HOST_CONFIG, files::SETTINGS]
            .into_iter()
            .map(String::from)
            .collect();

        let watchers: Vec<ChangeWatcher> = self
            .job_names()
            .into_iter()
            .map(|name| {
                let watched = HashSet::from([name.clone()]);
                let names_to_watch: NamesToWatch = Arc::new(move || watched.clone());
                ChangeWatcher::watch(
                    self.store.root().to_path_buf(),
                    self.change_callback(name),
                    relevant.clone(),
                    names_to_watch,
                    self.watch_options,
                )
            })
            .collect();
        {
            // Checked under the lock shutdown takes the watchers with, so a
            // shutdown either sees these watchers or they are stopped here.
            let mut registered = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                drop(registered);
                for watcher in &watchers {
                    watcher.stop();
                }
                debug!("Shut down while opening; watchers stopped");
                return;
            }
            registered.extend(watchers);
        }

        for name in self.job_names() {
            self.on_change(&name).await;
        }
        info!(jobs = ?self.job_names(), "Supervisor opened");
    }

    /// Callback for a job's watcher. Holds only a weak reference so the
    /// watcher never keeps the supervisor alive.
    fn change_callback(self: &Arc<Self>, job: String) -> ChangeCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |changed: String| {
            let weak = weak.clone();
            let job = job.clone();
            Box::pin(async move {
                debug!(job = %job, changed = %changed, "Change notification");
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_change(&job).await;
                }
            })
        })
    }

    /// Re-evaluate a job and drive its runner to match.
    pub async fn on_change(&self, name: &str) {
        let Some(state) = self.states.get(name) else {
            debug!(job = %name, "Ignoring change for unmanaged job");
            return;
        };
        let mut state = state.lock().await;
        if self.is_closed() {
            debug!(job = %name, "Supervisor closed, ignoring change");
            return;
        }

        let job = match self.store.read_job(name).await {
            Ok(job) => job,
            Err(e) => {
                state.release(name, false).await;
                state.set_error(name, format!("Failed to read job: {e}"));
                return;
            }
        };

        match job {
            None => {
                if state.phase != JobPhase::Stopped {
                    state.release(name, false).await;
                    state.set_stopped(name);
                }
            }
            Some(job) if job.has_error() => {
                state.release(name, false).await;
                let error = job.error.unwrap_or_default();
                state.set_error(name, error);
            }
            Some(job) => {
                let settings = job.settings.with_in_place();
                self.run_valid(name, &mut state, &job, &settings).await;
            }
        }
    }

    async fn run_valid(
        &self,
        name: &str,
        state: &mut RuntimeState,
        job: &JobDefinition,
        settings: &JobSettings,
    ) {
        let crashed = state.runner.as_ref().and_then(|r| r.exit_error());
        if let Some(runner) = state.runner.as_mut()
            && crashed.is_none()
        {
            let log_refresh = !state.first_observation;
            state.first_observation = false;
            if let Err(e) = runner.refresh(job, settings, log_refresh).await {
                state.release(name, false).await;
                state.set_error(name, e.to_string());
            }
            return;
        }

        if let Some(crash) = crashed {
            info!(job = %name, "Restarting after unexpected exit: {crash}");
        }
        state.release(name, false).await;

        let mut runner = self.runners.create(job);
        match runner.start(job, settings).await {
            Ok(()) => {
                state.runner = Some(runner);
                state.first_observation = true;
                state.set_running(name);
            }
            Err(e) => {
                runner.dispose().await;
                state.set_error(name, e.to_string());
            }
        }
    }

    /// Surface an unexpected host exit without starting anything.
    pub async fn observe(&self, name: &str) -> Option<JobStatus> {
        let mut state = self.states.get(name)?.lock().await;
        if state.phase == JobPhase::Running
            && let Some(crash) = state.runner.as_ref().and_then(|r| r.exit_error())
        {
            state.release(name, false).await;
            state.set_error(name, crash);
        }
        Some(state.status())
    }

    /// Stop all watchers, then every host. Idempotent; the supervisor never
    /// starts anything afterwards.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let watchers = std::mem::take(
            &mut *self
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for watcher in &watchers {
            watcher.stop();
        }
        drop(watchers);

        for name in self.job_names() {
            if let Some(state) = self.states.get(&name) {
                let mut state = state.lock().await;
                state.release(&name, true).await;
                state.set_stopped(&name);
            }
        }
        info!("Supervisor shut down");
    }

    /// Alias for [`shutdown`](Self::shutdown).
    pub async fn close(&self) {
        self.shutdown().await;
    }
}
