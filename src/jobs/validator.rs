//! Job definition validation.
//!
//! The supervisor never computes errors itself; it only consumes the marker
//! a validator attaches to a [`JobDefinition`](super::model::JobDefinition).

/// Raw file contents of a job, handed to a validator.
#[derive(Debug, Clone, Copy)]
pub struct JobFiles<'a> {
    pub name: &'a str,
    pub host_config: &'a str,
    pub settings: Option<&'a str>,
}

/// Annotates a job with an error marker when it is structurally invalid.
pub trait JobValidator: Send + Sync {
    /// `Some(reason)` when the job must not run.
    fn validate(&self, files: &JobFiles<'_>) -> Option<String>;
}

/// Checks that `host.json` and `settings.job` are JSON objects and that the
/// host id, when present, is a string.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl JobValidator for DefaultValidator {
    fn validate(&self, files: &JobFiles<'_>) -> Option<String> {
        let host: serde_json::Value = match serde_json::from_str(files.host_config) {
            Ok(v) => v,
            Err(e) => return Some(format!("host.json is not valid JSON: {e}")),
        };
        let Some(obj) = host.as_object() else {
            return Some("host.json must contain a JSON object".to_string());
        };
        if obj.get("id").is_some_and(|id| !id.is_string()) {
            return Some("host.json 'id' must be a string".to_string());
        }

        if let Some(raw) = files.settings {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(v) if v.is_object() => {}
                Ok(_) => return Some("settings.job must contain a JSON object".to_string()),
                Err(e) => return Some(format!("settings.job is not valid JSON: {e}")),
            }
        }

        None
    }
}
