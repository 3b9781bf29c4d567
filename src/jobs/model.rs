//! Job definitions and settings as read off disk.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Well-known job settings keys.
pub mod keys {
    /// Run the host from the job directory instead of a staged copy.
    pub const IS_IN_PLACE: &str = "is_in_place";
    /// Seconds the host gets to exit after a stop request.
    pub const STOPPING_WAIT_TIME: &str = "stopping_wait_time";
}

/// Kind of a job. Only continuous jobs are supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Continuous,
    Triggered,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Continuous => "continuous",
            Self::Triggered => "triggered",
        };
        write!(f, "{s}")
    }
}

/// A raw settings value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Per-job settings, keyed by setting name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSettings(BTreeMap<String, SettingValue>);

impl JobSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Read a boolean setting. Strings `"true"`/`"false"` are accepted since
    /// hand-written settings files often quote them.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::String(s) => s.trim().parse().ok(),
            SettingValue::Number(_) => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            SettingValue::Number(n) => n.as_u64(),
            SettingValue::String(s) => s.trim().parse().ok(),
            SettingValue::Bool(_) => None,
        }
    }

    pub fn is_in_place(&self) -> bool {
        self.get_bool(keys::IS_IN_PLACE).unwrap_or(false)
    }

    /// Copy with the run-in-place flag forced on.
    pub fn with_in_place(&self) -> Self {
        let mut settings = self.clone();
        settings.insert(keys::IS_IN_PLACE, true);
        settings
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A job as read from disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDefinition {
    pub name: String,
    pub kind: JobKind,
    /// Directory the job's binaries and configuration live in.
    pub binaries_root: PathBuf,
    pub settings: JobSettings,
    /// Set by the validator when the definition is unusable.
    pub error: Option<String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, kind: JobKind, binaries_root: PathBuf) -> Self {
        Self {
            name: name.into(),
            kind,
            binaries_root,
            settings: JobSettings::new(),
            error: None,
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// True when the validator attached a non-empty error marker.
    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Parsed `host.json` of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig(pub serde_json::Value);

impl HostConfig {
    /// Host identity used for queue names and status keys.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(|v| v.as_str())
    }
}

/// Parsed `function.json` of a single function inside a job.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionConfig {
    /// Function name (its directory name).
    pub name: String,
    pub config: serde_json::Value,
}

impl FunctionConfig {
    /// Argument name used when the configuration declares no input binding.
    pub const DEFAULT_INPUT_NAME: &'static str = "input";

    /// Name of the first declared input binding, or `"input"`.
    pub fn input_argument_name(&self) -> &str {
        self.config
            .get("bindings")
            .and_then(|b| b.get("input"))
            .and_then(|i| i.as_array())
            .and_then(|inputs| inputs.first())
            .and_then(|first| first.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or(Self::DEFAULT_INPUT_NAME)
    }

    /// Identity the host registers the function under.
    pub fn function_id(&self) -> String {
        function_id(&self.name)
    }
}

/// `Host.Functions.<name>`.
pub fn function_id(function_name: &str) -> String {
    format!("Host.Functions.{function_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_mixed_values() {
        let settings: JobSettings = serde_json::from_str(
            r#"{"is_in_place": "true", "stopping_wait_time": 12, "note": "hi"}"#,
        )
        .unwrap();
        assert!(settings.is_in_place());
        assert_eq!(settings.get_u64(keys::STOPPING_WAIT_TIME), Some(12));
        assert_eq!(settings.get("note"), Some(&SettingValue::String("hi".into())));
    }

    #[test]
    fn with_in_place_does_not_mutate_source() {
        let settings = JobSettings::new();
        let forced = settings.with_in_place();
        assert!(!settings.is_in_place());
        assert!(forced.is_in_place());
    }

    #[test]
    fn input_name_from_bindings() {
        let cfg = FunctionConfig {
            name: "myFn".into(),
            config: serde_json::json!({"bindings": {"input": [{"name": "req", "type": "http"}]}}),
        };
        assert_eq!(cfg.input_argument_name(), "req");
        assert_eq!(cfg.function_id(), "Host.Functions.myFn");
    }

    #[test]
    fn input_name_defaults_when_undeclared() {
        for config in [
            serde_json::json!({}),
            serde_json::json!({"bindings": {}}),
            serde_json::json!({"bindings": {"input": []}}),
            serde_json::json!({"bindings": {"input": [{"type": "queue"}]}}),
        ] {
            let cfg = FunctionConfig { name: "f".into(), config };
            assert_eq!(cfg.input_argument_name(), "input");
        }
    }

    #[test]
    fn empty_error_marker_is_not_an_error() {
        let job = JobDefinition::new("j", JobKind::Continuous, PathBuf::from("/tmp/j"));
        assert!(!job.has_error());
        assert!(!job.clone().with_error("").has_error());
        assert!(job.with_error("bad host.json").has_error());
    }

    #[test]
    fn job_kind_display() {
        assert_eq!(JobKind::Continuous.to_string(), "continuous");
        assert_eq!(JobKind::Triggered.to_string(), "triggered");
    }
}
