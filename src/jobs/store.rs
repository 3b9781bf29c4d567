//! Read-only access to job definitions persisted as files.
//!
//! Layout under the jobs root:
//!
//! ```text
//! <root>/
//! └── <job>/
//!     ├── host.json          ← host configuration (required)
//!     ├── settings.job       ← raw job settings (optional JSON object)
//!     └── <function>/
//!         └── function.json  ← function configuration
//! ```

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::model::{FunctionConfig, HostConfig, JobDefinition, JobKind, JobSettings};
use super::validator::{DefaultValidator, JobFiles, JobValidator};
use crate::error::JobError;

/// Well-known file names inside a job directory.
pub mod files {
    pub const HOST_CONFIG: &str = "host.json";
    pub const SETTINGS: &str = "settings.job";
    pub const FUNCTION_CONFIG: &str = "function.json";
}

/// Read access to persisted job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Directory the jobs live under.
    fn root(&self) -> &Path;

    /// Read a job. `Ok(None)` when the job directory or its host
    /// configuration file does not exist.
    async fn read_job(&self, name: &str) -> Result<Option<JobDefinition>, JobError>;

    /// Names of all jobs that have a host configuration file.
    async fn list_job_names(&self) -> Result<Vec<String>, JobError>;

    /// Parsed `host.json` of a job.
    async fn read_host_config(&self, job: &str) -> Result<Option<HostConfig>, JobError>;

    /// Parsed `function.json` of a function inside a job.
    async fn read_function_config(
        &self,
        job: &str,
        function: &str,
    ) -> Result<Option<FunctionConfig>, JobError>;
}

/// Filesystem-backed [`JobStore`].
pub struct FileJobStore {
    root: PathBuf,
    kind: JobKind,
    validator: Box<dyn JobValidator>,
}

impl FileJobStore {
    /// Create a store for jobs of `kind` rooted at `root`.
    pub fn new(root: PathBuf, kind: JobKind) -> Self {
        Self {
            root,
            kind,
            validator: Box::new(DefaultValidator),
        }
    }

    /// Replace the validator used to annotate definitions.
    pub fn with_validator(mut self, validator: Box<dyn JobValidator>) -> Self {
        self.validator = validator;
        self
    }

    fn job_dir(&self, name: &str) -> Option<PathBuf> {
        is_plain_name(name).then(|| self.root.join(name))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_job(&self, name: &str) -> Result<Option<JobDefinition>, JobError> {
        let Some(dir) = self.job_dir(name) else {
            return Ok(None);
        };
        if !fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            debug!(job = %name, "Job directory missing");
            return Ok(None);
        }

        let Some(host_raw) = read_optional(&dir.join(files::HOST_CONFIG)).await? else {
            debug!(job = %name, "Host configuration missing");
            return Ok(None);
        };
        let settings_raw = read_optional(&dir.join(files::SETTINGS)).await?;

        // Unusable settings mark the job invalid rather than running it
        // with defaults.
        let (settings, settings_error) = match settings_raw.as_deref() {
            None => (JobSettings::default(), None),
            Some(raw) => match serde_json::from_str::<JobSettings>(raw) {
                Ok(settings) => (settings, None),
                Err(e) => (
                    JobSettings::default(),
                    Some(format!("{} is not a valid settings object: {e}", files::SETTINGS)),
                ),
            },
        };

        let mut job = JobDefinition::new(name, self.kind, dir).with_settings(settings);
        job.error = self
            .validator
            .validate(&JobFiles {
                name,
                host_config: &host_raw,
                settings: settings_raw.as_deref(),
            })
            .or(settings_error);
        Ok(Some(job))
    }

    async fn list_job_names(&self) -> Result<Vec<String>, JobError> {
        let mut names = Vec::new();
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if fs::metadata(entry.path().join(files::HOST_CONFIG))
                .await
                .is_ok_and(|m| m.is_file())
            {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_host_config(&self, job: &str) -> Result<Option<HostConfig>, JobError> {
        let Some(dir) = self.job_dir(job) else {
            return Ok(None);
        };
        let path = dir.join(files::HOST_CONFIG);
        match read_optional(&path).await? {
            Some(raw) => parse_json(&path, &raw).map(|v| Some(HostConfig(v))),
            None => Ok(None),
        }
    }

    async fn read_function_config(
        &self,
        job: &str,
        function: &str,
    ) -> Result<Option<FunctionConfig>, JobError> {
        let Some(dir) = self.job_dir(job) else {
            return Ok(None);
        };
        if !is_plain_name(function) {
            return Ok(None);
        }
        let path = dir.join(function).join(files::FUNCTION_CONFIG);
        match read_optional(&path).await? {
            Some(raw) => Ok(Some(FunctionConfig {
                name: function.to_string(),
                config: parse_json(&path, &raw)?,
            })),
            None => Ok(None),
        }
    }
}

/// A single normal path component: no separators, no `.`/`..`.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn read_optional(path: &Path) -> Result<Option<String>, JobError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_json(path: &Path, raw: &str) -> Result<serde_json::Value, JobError> {
    serde_json::from_str(raw).map_err(|e| JobError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
