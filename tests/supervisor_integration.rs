//! Integration tests for the continuous job supervisor.
//!
//! Runners are stubs that count live handles, so these tests exercise the
//! state machine and its locking without spawning real hosts. The
//! watcher-driven tests use a real directory under a `TempDir`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use host_supervisor::error::{JobError, ProcessError};
use host_supervisor::jobs::{
    FileJobStore, FunctionConfig, HostConfig, JobDefinition, JobKind, JobSettings, JobStore,
};
use host_supervisor::process::{JobRunner, RunnerFactory};
use host_supervisor::supervisor::{ContinuousJobSupervisor, JobPhase};
use host_supervisor::watcher::WatchOptions;

/// Maximum time any wait in these tests is allowed to take.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const FAST_WATCH: WatchOptions = WatchOptions {
    debounce: Duration::from_millis(100),
    poll_interval: Duration::from_millis(50),
};

// ── Stub store ──────────────────────────────────────────────────────────

/// In-memory job store; tests flip definitions in and out.
struct StubStore {
    root: PathBuf,
    jobs: Mutex<HashMap<String, JobDefinition>>,
}

impl StubStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            root: PathBuf::from("/nonexistent/jobs"),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn put(&self, job: JobDefinition) {
        self.jobs.lock().unwrap().insert(job.name.clone(), job);
    }

    fn remove(&self, name: &str) {
        self.jobs.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl JobStore for StubStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_job(&self, name: &str) -> Result<Option<JobDefinition>, JobError> {
        Ok(self.jobs.lock().unwrap().get(name).cloned())
    }

    async fn list_job_names(&self) -> Result<Vec<String>, JobError> {
        Ok(self.jobs.lock().unwrap().keys().cloned().collect())
    }

    async fn read_host_config(&self, _job: &str) -> Result<Option<HostConfig>, JobError> {
        Ok(None)
    }

    async fn read_function_config(
        &self,
        _job: &str,
        _function: &str,
    ) -> Result<Option<FunctionConfig>, JobError> {
        Ok(None)
    }
}

fn valid_job(name: &str) -> JobDefinition {
    JobDefinition::new(name, JobKind::Continuous, PathBuf::from("/jobs").join(name))
}

// ── Stub runners ────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    max_live: AtomicUsize,
    created: AtomicUsize,
    starts: AtomicUsize,
    shutdown_stops: AtomicUsize,
    refresh_flags: Mutex<Vec<bool>>,
    started_in_place: Mutex<Vec<bool>>,
    fail_start: AtomicBool,
    crash: Mutex<Option<String>>,
}

impl Counters {
    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

struct StubRunner {
    name: String,
    counters: Arc<Counters>,
    running: bool,
    closed: bool,
}

impl StubRunner {
    fn release(&mut self) {
        if self.running {
            self.running = false;
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl JobRunner for StubRunner {
    async fn start(
        &mut self,
        _job: &JobDefinition,
        settings: &JobSettings,
    ) -> Result<(), ProcessError> {
        if self.closed {
            return Err(ProcessError::ShutDown {
                name: self.name.clone(),
            });
        }
        if self.counters.fail_start.load(Ordering::SeqCst) {
            return Err(ProcessError::SpawnFailed {
                name: self.name.clone(),
                reason: "stub failure".to_string(),
            });
        }
        if !self.running {
            self.running = true;
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.counters
            .started_in_place
            .lock()
            .unwrap()
            .push(settings.is_in_place());
        // Widen the window in which another transition could interleave.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn refresh(
        &mut self,
        _job: &JobDefinition,
        _settings: &JobSettings,
        log_refresh: bool,
    ) -> Result<(), ProcessError> {
        self.counters.refresh_flags.lock().unwrap().push(log_refresh);
        Ok(())
    }

    async fn stop(&mut self, is_shutdown: bool) -> Result<(), ProcessError> {
        tokio::task::yield_now().await;
        self.release();
        if is_shutdown {
            self.closed = true;
            self.counters.shutdown_stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn dispose(&mut self) {
        self.release();
    }

    fn exit_error(&self) -> Option<String> {
        if self.running {
            self.counters.crash.lock().unwrap().clone()
        } else {
            None
        }
    }

    fn is_running(&self) -> bool {
        self.running && self.exit_error().is_none()
    }
}

impl Drop for StubRunner {
    fn drop(&mut self) {
        self.release();
    }
}

struct StubFactory {
    counters: Arc<Counters>,
}

impl RunnerFactory for StubFactory {
    fn create(&self, job: &JobDefinition) -> Box<dyn JobRunner> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Box::new(StubRunner {
            name: job.name.clone(),
            counters: Arc::clone(&self.counters),
            running: false,
            closed: false,
        })
    }
}

fn supervisor(
    store: Arc<dyn JobStore>,
    names: &[&str],
) -> (Arc<ContinuousJobSupervisor>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let factory = Arc::new(StubFactory {
        counters: Arc::clone(&counters),
    });
    let supervisor = ContinuousJobSupervisor::new(
        store,
        factory,
        names.iter().map(|n| n.to_string()),
        FAST_WATCH,
    );
    (supervisor, counters)
}

/// Poll until `check` holds or the test timeout elapses.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ── State machine ───────────────────────────────────────────────────────

#[tokio::test]
async fn timer1_absent_then_valid_starts_once_in_place() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["timer1"]);

    supervisor.on_change("timer1").await;
    let status = supervisor.observe("timer1").await.unwrap();
    assert_eq!(status.phase, JobPhase::Stopped);
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);

    store.put(valid_job("timer1"));
    supervisor.on_change("timer1").await;

    let status = supervisor.observe("timer1").await.unwrap();
    assert_eq!(status.phase, JobPhase::Running);
    assert!(status.error.is_none());
    assert_eq!(counters.starts(), 1);
    assert_eq!(counters.live(), 1);
    assert_eq!(*counters.started_in_place.lock().unwrap(), vec![true]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn invalid_then_valid_then_absent() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);

    store.put(valid_job("job").with_error("host.json is not valid JSON"));
    supervisor.on_change("job").await;
    let status = supervisor.observe("job").await.unwrap();
    assert_eq!(status.phase, JobPhase::Error);
    assert_eq!(status.error.as_deref(), Some("host.json is not valid JSON"));
    assert_eq!(counters.live(), 0);

    store.put(valid_job("job"));
    supervisor.on_change("job").await;
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Running);
    assert_eq!(counters.live(), 1);

    store.put(valid_job("job").with_error("broken again"));
    supervisor.on_change("job").await;
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Error);
    assert_eq!(counters.live(), 0);

    store.put(valid_job("job"));
    supervisor.on_change("job").await;
    store.remove("job");
    supervisor.on_change("job").await;
    let status = supervisor.observe("job").await.unwrap();
    assert_eq!(status.phase, JobPhase::Stopped);
    assert!(status.error.is_none());
    assert_eq!(counters.live(), 0);
}

#[tokio::test]
async fn start_failure_is_error_without_handle() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);
    counters.fail_start.store(true, Ordering::SeqCst);

    store.put(valid_job("job"));
    supervisor.on_change("job").await;

    let status = supervisor.observe("job").await.unwrap();
    assert_eq!(status.phase, JobPhase::Error);
    assert!(status.error.unwrap().contains("stub failure"));
    assert_eq!(counters.live(), 0);

    // Retried on the next change only.
    counters.fail_start.store(false, Ordering::SeqCst);
    supervisor.on_change("job").await;
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Running);
}

#[tokio::test]
async fn first_refresh_after_start_is_not_logged() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);
    store.put(valid_job("job"));

    supervisor.on_change("job").await;
    supervisor.on_change("job").await;
    supervisor.on_change("job").await;

    assert_eq!(counters.starts(), 1);
    assert_eq!(*counters.refresh_flags.lock().unwrap(), vec![false, true]);
}

#[tokio::test]
async fn crash_is_observed_then_restarted_on_change() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);
    store.put(valid_job("job"));
    supervisor.on_change("job").await;

    *counters.crash.lock().unwrap() = Some("Host exited unexpectedly with code 3".to_string());
    let status = supervisor.observe("job").await.unwrap();
    assert_eq!(status.phase, JobPhase::Error);
    assert_eq!(
        status.error.as_deref(),
        Some("Host exited unexpectedly with code 3")
    );
    assert_eq!(counters.live(), 0);
    // No automatic restart.
    assert_eq!(counters.starts(), 1);

    *counters.crash.lock().unwrap() = None;
    supervisor.on_change("job").await;
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Running);
    assert_eq!(counters.starts(), 2);
    assert_eq!(counters.live(), 1);
}

#[tokio::test]
async fn unmanaged_names_are_ignored() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);
    store.put(valid_job("other"));

    supervisor.on_change("other").await;
    assert!(supervisor.observe("other").await.is_none());
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_changes_keep_one_live_handle() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);

    let mut tasks = Vec::new();
    for i in 0..64 {
        if i % 3 == 0 {
            store.remove("job");
        } else {
            store.put(valid_job("job"));
        }
        let supervisor = Arc::clone(&supervisor);
        tasks.push(tokio::spawn(async move {
            supervisor.on_change("job").await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(counters.max_live.load(Ordering::SeqCst) <= 1);

    // Settle on a final definition and check state and handles agree.
    store.put(valid_job("job"));
    supervisor.on_change("job").await;
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Running);
    assert_eq!(counters.live(), 1);

    supervisor.shutdown().await;
    assert_eq!(counters.live(), 0);
    assert!(counters.max_live.load(Ordering::SeqCst) <= 1);
}

// ── Shutdown ────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_is_terminal_and_idempotent() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["a", "b"]);
    store.put(valid_job("a"));
    store.put(valid_job("b"));
    supervisor.on_change("a").await;
    supervisor.on_change("b").await;
    assert_eq!(counters.live(), 2);

    supervisor.shutdown().await;
    supervisor.close().await;
    assert!(supervisor.is_closed());
    assert_eq!(counters.live(), 0);
    assert_eq!(counters.shutdown_stops.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.observe("a").await.unwrap().phase, JobPhase::Stopped);

    supervisor.on_change("a").await;
    supervisor.open().await;
    assert_eq!(counters.live(), 0);
    assert_eq!(counters.starts(), 2);
}

#[tokio::test]
async fn shutdown_racing_changes_leaves_nothing_running() {
    let store = StubStore::new();
    let (supervisor, counters) = supervisor(store.clone(), &["job"]);
    store.put(valid_job("job"));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let supervisor = Arc::clone(&supervisor);
        tasks.push(tokio::spawn(async move {
            supervisor.on_change("job").await;
        }));
    }
    supervisor.shutdown().await;
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(counters.live(), 0);
    assert_eq!(supervisor.observe("job").await.unwrap().phase, JobPhase::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_racing_open_leaves_no_watchers() {
    for _ in 0..20 {
        let store = StubStore::new();
        store.put(valid_job("job"));
        let (supervisor, counters) = supervisor(store.clone(), &["job", "other"]);

        let opener = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.open().await })
        };
        supervisor.shutdown().await;
        opener.await.unwrap();

        assert!(supervisor.is_closed());
        assert_eq!(supervisor.active_watchers(), 0);
        assert_eq!(counters.live(), 0);
    }
}

#[tokio::test]
async fn open_registers_one_watcher_per_job() {
    let store = StubStore::new();
    let (supervisor, _counters) = supervisor(store.clone(), &["a", "b"]);

    supervisor.open().await;
    assert_eq!(supervisor.active_watchers(), 2);

    supervisor.shutdown().await;
    assert_eq!(supervisor.active_watchers(), 0);
}

// ── Watcher-driven ──────────────────────────────────────────────────────

fn file_store(root: &Path) -> Arc<dyn JobStore> {
    Arc::new(FileJobStore::new(root.to_path_buf(), JobKind::Continuous))
}

#[tokio::test]
async fn file_changes_drive_the_supervisor() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let (supervisor, counters) = supervisor(file_store(&root), &["functions"]);

    supervisor.open().await;
    // Let the watcher subscribe before touching the tree.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        supervisor.observe("functions").await.unwrap().phase,
        JobPhase::Stopped
    );

    let job_dir = root.join("functions");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(job_dir.join("host.json"), r#"{"id":"h1"}"#).unwrap();

    assert!(eventually(|| counters.live() == 1).await, "host never started");
    assert_eq!(counters.starts(), 1);

    std::fs::write(job_dir.join("host.json"), "{ not json").unwrap();
    assert!(eventually(|| counters.live() == 0).await, "host never stopped");
    let status = supervisor.observe("functions").await.unwrap();
    assert_eq!(status.phase, JobPhase::Error);
    assert!(status.error.is_some());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn no_start_after_shutdown_even_with_pending_events() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let (supervisor, counters) = supervisor(file_store(&root), &["functions"]);

    supervisor.open().await;
    // Let the watcher subscribe before touching the tree.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job_dir = root.join("functions");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(job_dir.join("host.json"), r#"{"id":"h1"}"#).unwrap();
    // Inside the debounce window.
    supervisor.shutdown().await;

    tokio::time::sleep(FAST_WATCH.debounce * 4).await;
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    assert_eq!(counters.live(), 0);
}
