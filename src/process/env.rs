//! Translation of job settings into the host's environment.

use std::path::Path;

use crate::jobs::{JobDefinition, JobSettings};

pub const JOB_NAME: &str = "HOST_JOB_NAME";
pub const JOB_KIND: &str = "HOST_JOB_KIND";
pub const JOB_ROOT: &str = "HOST_JOB_ROOT";
pub const JOB_WORKING_DIR: &str = "HOST_JOB_WORKING_DIR";
pub const JOB_RUN_ID: &str = "HOST_JOB_RUN_ID";
pub const SETTING_PREFIX: &str = "HOST_JOB_SETTING_";

/// Environment variables handed to the host for one run.
pub fn host_environment(
    job: &JobDefinition,
    settings: &JobSettings,
    working_dir: &Path,
    run_id: &str,
) -> Vec<(String, String)> {
    let mut env = vec![
        (JOB_NAME.to_string(), job.name.clone()),
        (JOB_KIND.to_string(), job.kind.to_string()),
        (
            JOB_ROOT.to_string(),
            job.binaries_root.to_string_lossy().to_string(),
        ),
        (
            JOB_WORKING_DIR.to_string(),
            working_dir.to_string_lossy().to_string(),
        ),
        (JOB_RUN_ID.to_string(), run_id.to_string()),
    ];
    env.extend(
        settings
            .iter()
            .map(|(key, value)| (setting_var(key), value.to_string())),
    );
    env
}

/// `stopping_wait_time` → `HOST_JOB_SETTING_STOPPING_WAIT_TIME`.
pub fn setting_var(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{SETTING_PREFIX}{normalized}")
}
