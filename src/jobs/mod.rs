//! Job definitions: model, file-backed store and validation.

pub mod model;
pub mod store;
pub mod validator;

pub use model::{FunctionConfig, HostConfig, JobDefinition, JobKind, JobSettings, SettingValue};
pub use store::{FileJobStore, JobStore};
pub use validator::{DefaultValidator, JobFiles, JobValidator};
