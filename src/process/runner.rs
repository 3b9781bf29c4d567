//! Host process runner.
//!
//! A [`ProcessRunner`] owns at most one child process. A monitor task holds
//! the `Child` itself; the runner keeps the pid, a kill switch and a watch
//! channel the monitor publishes the exit record on. Stopping sends SIGTERM,
//! waits out the grace period, then kills.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::env::host_environment;
use crate::config::SupervisorConfig;
use crate::error::ProcessError;
use crate::jobs::model::keys;
use crate::jobs::{JobDefinition, JobSettings};

/// Lines of stderr kept for exit diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the host to die after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How long output readers get to drain after the host exits.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle operations on a supervised job's process.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Launch the host, stopping any previous instance first.
    async fn start(&mut self, job: &JobDefinition, settings: &JobSettings)
    -> Result<(), ProcessError>;

    /// Apply freshly read settings, restarting only when needed.
    async fn refresh(
        &mut self,
        job: &JobDefinition,
        settings: &JobSettings,
        log_refresh: bool,
    ) -> Result<(), ProcessError>;

    /// Stop the host. With `is_shutdown` the runner becomes terminal.
    async fn stop(&mut self, is_shutdown: bool) -> Result<(), ProcessError>;

    /// Stop and release everything. Idempotent.
    async fn dispose(&mut self);

    /// Description of an unexpected exit, if the host died on its own.
    fn exit_error(&self) -> Option<String>;

    fn is_running(&self) -> bool;
}

/// Builds runners for jobs.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, job: &JobDefinition) -> Box<dyn JobRunner>;
}

/// How hosts are launched.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Executable launched for every job.
    pub executable: PathBuf,
    /// Arguments passed before anything else.
    pub args: Vec<String>,
    /// Staged copies live under `<data_dir>/staging`.
    pub data_dir: PathBuf,
    /// Default time between SIGTERM and kill.
    pub grace_period: Duration,
}

impl RunnerOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            executable: config.host_executable.clone(),
            args: Vec::new(),
            data_dir: config.data_dir.clone(),
            grace_period: config.stop_grace_period,
        }
    }
}

/// What a host exit looked like.
#[derive(Debug, Clone)]
struct ExitRecord {
    code: Option<i32>,
    stderr_tail: String,
    /// The exit followed a stop request.
    expected: bool,
}

impl ExitRecord {
    fn describe(&self) -> String {
        let code = self
            .code
            .map(|c| format!("code {c}"))
            .unwrap_or_else(|| "no exit code (terminated by signal)".to_string());
        if self.stderr_tail.is_empty() {
            format!("Host exited unexpectedly with {code}")
        } else {
            format!("Host exited unexpectedly with {code}: {}", self.stderr_tail)
        }
    }
}

/// What a host was launched with. Every setting reaches the host through
/// its environment, so any difference requires a restart.
#[derive(Debug, Clone, PartialEq)]
struct LaunchConfig {
    binaries_root: PathBuf,
    in_place: bool,
    settings: JobSettings,
}

impl LaunchConfig {
    fn of(job: &JobDefinition, settings: &JobSettings) -> Self {
        Self {
            binaries_root: job.binaries_root.clone(),
            in_place: settings.is_in_place(),
            settings: settings.clone(),
        }
    }
}

struct RunningHost {
    pid: Option<u32>,
    launch: LaunchConfig,
    grace: Duration,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
    kill_tx: Option<oneshot::Sender<()>>,
    stopping: Arc<AtomicBool>,
    staging_dir: Option<PathBuf>,
}

impl RunningHost {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
    }
}

/// Owns the host process of one job.
pub struct ProcessRunner {
    name: String,
    options: RunnerOptions,
    host: Option<RunningHost>,
    closed: bool,
}

impl ProcessRunner {
    pub fn new(name: impl Into<String>, options: RunnerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            host: None,
            closed: false,
        }
    }

    fn grace_for(&self, settings: &JobSettings) -> Duration {
        settings
            .get_u64(keys::STOPPING_WAIT_TIME)
            .map(Duration::from_secs)
            .unwrap_or(self.options.grace_period)
    }

    async fn launch(
        &self,
        job: &JobDefinition,
        settings: &JobSettings,
    ) -> Result<RunningHost, ProcessError> {
        let executable = &self.options.executable;
        if !tokio::fs::metadata(executable)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Err(ProcessError::ExecutableNotFound(executable.clone()));
        }

        let launch = LaunchConfig::of(job, settings);
        let run_id = Uuid::new_v4().to_string();
        let staging_dir = if launch.in_place {
            None
        } else {
            Some(self.stage(&job.binaries_root, &run_id).await?)
        };
        let working_dir = staging_dir
            .clone()
            .unwrap_or_else(|| job.binaries_root.clone());

        let mut command = Command::new(executable);
        command
            .args(&self.options.args)
            .current_dir(&working_dir)
            .envs(host_environment(job, settings, &working_dir, &run_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(dir) = &staging_dir
                    && let Err(cleanup) = tokio::fs::remove_dir_all(dir).await
                {
                    debug!(job = %self.name, dir = %dir.display(), "Failed to remove staging dir: {cleanup}");
                }
                return Err(ProcessError::SpawnFailed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id();

        info!(
            job = %self.name,
            pid = ?pid,
            run_id = %run_id,
            in_place = launch.in_place,
            working_dir = %working_dir.display(),
            "Host started"
        );

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let readers = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(forward_lines(self.name.clone(), out, None))),
            child.stderr.take().map(|err| {
                tokio::spawn(forward_lines(self.name.clone(), err, Some(Arc::clone(&tail))))
            }),
        ];

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stopping = Arc::new(AtomicBool::new(false));
        let monitor_stopping = Arc::clone(&stopping);
        let name = self.name.clone();

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                // Fires on an explicit kill and when the runner is dropped.
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for reader in readers.into_iter().flatten() {
                let _ = tokio::time::timeout(DRAIN_WAIT, reader).await;
            }

            let stderr_tail = tail
                .lock()
                .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            let record = ExitRecord {
                code: status.as_ref().ok().and_then(|s| s.code()),
                stderr_tail,
                expected: monitor_stopping.load(Ordering::SeqCst),
            };

            if record.expected {
                info!(job = %name, code = ?record.code, "Host exited");
            } else {
                warn!(job = %name, code = ?record.code, "Host exited unexpectedly");
            }
            let _ = exit_tx.send(Some(record));
        });

        Ok(RunningHost {
            pid,
            launch,
            grace: self.grace_for(settings),
            exit_rx,
            kill_tx: Some(kill_tx),
            stopping,
            staging_dir,
        })
    }

    /// Copy the job's binaries to a fresh staging directory.
    async fn stage(&self, source: &Path, run_id: &str) -> Result<PathBuf, ProcessError> {
        let short_id: String = run_id.chars().take(8).collect();
        let target = self
            .options
            .data_dir
            .join("staging")
            .join(&self.name)
            .join(short_id);

        let src = source.to_path_buf();
        let dst = target.clone();
        tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
            .await
            .map_err(|e| ProcessError::Staging {
                name: self.name.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| ProcessError::Staging {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        debug!(job = %self.name, target = %target.display(), "Staged host binaries");
        Ok(target)
    }

    async fn stop_host(&mut self) -> Result<(), ProcessError> {
        let Some(mut host) = self.host.take() else {
            return Ok(());
        };
        host.stopping.store(true, Ordering::SeqCst);

        let mut result = Ok(());
        if !host.has_exited() {
            let exited = send_terminate(&self.name, host.pid)
                && wait_for_exit(&mut host.exit_rx, host.grace).await;
            if !exited {
                warn!(job = %self.name, grace = ?host.grace, "Host did not stop in time, killing");
                host.kill();
                if !wait_for_exit(&mut host.exit_rx, KILL_WAIT).await {
                    warn!(job = %self.name, "Host still running after kill");
                }
                result = Err(ProcessError::StopTimeout {
                    name: self.name.clone(),
                    grace: host.grace,
                });
            }
        }

        if let Some(dir) = host.staging_dir.take()
            && let Err(e) = tokio::fs::remove_dir_all(&dir).await
        {
            debug!(job = %self.name, dir = %dir.display(), "Failed to remove staging dir: {e}");
        }

        info!(job = %self.name, "Host stopped");
        result
    }
}

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn start(
        &mut self,
        job: &JobDefinition,
        settings: &JobSettings,
    ) -> Result<(), ProcessError> {
        if self.closed {
            return Err(ProcessError::ShutDown {
                name: self.name.clone(),
            });
        }
        // Never two live children for one runner.
        if let Err(e) = self.stop_host().await {
            warn!(job = %self.name, "Previous host did not stop cleanly: {e}");
        }
        self.host = Some(self.launch(job, settings).await?);
        Ok(())
    }

    async fn refresh(
        &mut self,
        job: &JobDefinition,
        settings: &JobSettings,
        log_refresh: bool,
    ) -> Result<(), ProcessError> {
        if self.closed {
            return Err(ProcessError::ShutDown {
                name: self.name.clone(),
            });
        }

        let wanted = LaunchConfig::of(job, settings);
        let restart_reason = match &self.host {
            None => Some("host not running"),
            Some(host) if host.has_exited() => Some("host has exited"),
            Some(host) if host.launch != wanted => Some("settings changed"),
            Some(_) => None,
        };

        match restart_reason {
            Some(reason) => {
                if log_refresh {
                    info!(job = %self.name, reason, "Restarting host");
                }
                self.start(job, settings).await
            }
            None => {
                let grace = self.grace_for(settings);
                if let Some(host) = self.host.as_mut() {
                    host.grace = grace;
                }
                if log_refresh {
                    debug!(job = %self.name, "Host refreshed, no restart needed");
                }
                Ok(())
            }
        }
    }

    async fn stop(&mut self, is_shutdown: bool) -> Result<(), ProcessError> {
        if is_shutdown {
            self.closed = true;
        }
        self.stop_host().await
    }

    async fn dispose(&mut self) {
        if self.closed && self.host.is_none() {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stop_host().await {
            warn!(job = %self.name, "Dispose: {e}");
        }
    }

    fn exit_error(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        let exit = host.exit_rx.borrow();
        exit.as_ref()
            .filter(|record| !record.expected)
            .map(ExitRecord::describe)
    }

    fn is_running(&self) -> bool {
        self.host.as_ref().is_some_and(|h| !h.has_exited())
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if let Some(mut host) = self.host.take() {
            host.stopping.store(true, Ordering::SeqCst);
            host.kill();
        }
    }
}

/// Builds [`ProcessRunner`]s sharing one set of launch options.
#[derive(Debug, Clone)]
pub struct ProcessRunnerFactory {
    options: RunnerOptions,
}

impl ProcessRunnerFactory {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }
}

impl RunnerFactory for ProcessRunnerFactory {
    fn create(&self, job: &JobDefinition) -> Box<dyn JobRunner> {
        Box::new(ProcessRunner::new(job.name.clone(), self.options.clone()))
    }
}

/// Forward output lines to the log; stderr lines are also kept in `tail`.
async fn forward_lines<R>(name: String, stream: R, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &tail {
            Some(tail) => {
                warn!(job = %name, "host: {line}");
                if let Ok(mut buf) = tail.lock() {
                    if buf.len() == STDERR_TAIL_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            }
            None => debug!(job = %name, "host: {line}"),
        }
    }
}

/// Wait until the monitor has published an exit record.
async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitRecord>>, within: Duration) -> bool {
    matches!(
        tokio::time::timeout(within, exit_rx.wait_for(|exit| exit.is_some())).await,
        Ok(Ok(_))
    )
}

/// Ask the host to exit. Returns false when no graceful signal was sent.
#[cfg(unix)]
fn send_terminate(name: &str, pid: Option<u32>) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(job = %name, pid, "SIGTERM failed: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_name: &str, _pid: Option<u32>) -> bool {
    false
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
