//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Name of the singleton continuous job that hosts all functions.
pub const DEFAULT_HOST_JOB_NAME: &str = "functions";

/// Prefix of the queue the host consumes invocations from.
pub const DEFAULT_QUEUE_PREFIX: &str = "azure-webjobs-host";

/// Container the host writes invocation status records into.
pub const DEFAULT_STATUS_CONTAINER: &str = "azure-webjobs-hosts";

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding one subdirectory per job.
    pub jobs_root: PathBuf,
    /// Scratch directory for staged binaries.
    pub data_dir: PathBuf,
    /// Jobs supervised as continuous jobs.
    pub job_names: Vec<String>,
    /// Executable launched for every continuous job.
    pub host_executable: PathBuf,
    /// Quiet period before a burst of file events is acted on.
    pub debounce: Duration,
    /// How often a missing watch root is re-checked.
    pub watcher_poll_interval: Duration,
    /// How long a host gets to exit after SIGTERM before it is killed.
    pub stop_grace_period: Duration,
    /// Queue name prefix; the host id is appended.
    pub queue_prefix: String,
    /// Blob container holding invocation status records.
    pub status_container: String,
    /// Root of the local durable queue/blob store.
    pub storage_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from("./site/jobs"),
            data_dir: PathBuf::from("./data"),
            job_names: vec![DEFAULT_HOST_JOB_NAME.to_string()],
            host_executable: PathBuf::from("./host/WebJobs.Script.Host"),
            debounce: Duration::from_millis(500),
            watcher_poll_interval: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(5),
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            status_container: DEFAULT_STATUS_CONTAINER.to_string(),
            storage_dir: PathBuf::from("./data/storage"),
        }
    }
}

impl SupervisorConfig {
    /// Build config from `HOST_SUPERVISOR_*` environment variables, falling
    /// back to [`Default`] for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let job_names: Vec<String> = std::env::var("HOST_SUPERVISOR_JOBS")
            .map(|s| {
                s.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.job_names);

        if job_names.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "HOST_SUPERVISOR_JOBS".to_string(),
                message: "at least one job name is required".to_string(),
            });
        }

        Ok(Self {
            jobs_root: env_path("HOST_SUPERVISOR_JOBS_ROOT").unwrap_or(defaults.jobs_root),
            data_dir: env_path("HOST_SUPERVISOR_DATA_DIR").unwrap_or(defaults.data_dir),
            job_names,
            host_executable: env_path("HOST_SUPERVISOR_HOST_EXECUTABLE")
                .unwrap_or(defaults.host_executable),
            debounce: env_u64("HOST_SUPERVISOR_DEBOUNCE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            watcher_poll_interval: env_u64("HOST_SUPERVISOR_WATCHER_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.watcher_poll_interval),
            stop_grace_period: env_u64("HOST_SUPERVISOR_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_grace_period),
            queue_prefix: std::env::var("HOST_SUPERVISOR_QUEUE_PREFIX")
                .unwrap_or(defaults.queue_prefix),
            status_container: std::env::var("HOST_SUPERVISOR_STATUS_CONTAINER")
                .unwrap_or(defaults.status_container),
            storage_dir: env_path("HOST_SUPERVISOR_STORAGE_DIR").unwrap_or(defaults.storage_dir),
        })
    }

    /// Name of the singleton host job (the first configured job).
    pub fn host_job_name(&self) -> &str {
        self.job_names
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_HOST_JOB_NAME)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_supervise_the_functions_host() {
        let config = SupervisorConfig::default();
        assert_eq!(config.job_names, vec!["functions".to_string()]);
        assert_eq!(config.host_job_name(), "functions");
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.queue_prefix, "azure-webjobs-host");
        assert_eq!(config.status_container, "azure-webjobs-hosts");
    }

    #[test]
    fn env_u64_absent_is_none() {
        assert!(
            env_u64("HOST_SUPERVISOR_TEST_SURELY_UNSET_VARIABLE")
                .unwrap()
                .is_none()
        );
    }
}
