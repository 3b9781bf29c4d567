//! Queue message asking a host to invoke one function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::function_id;

/// Message type understood by the host's invoke queue listener.
pub const CALL_AND_OVERRIDE: &str = "CallAndOverride";

/// Recorded on every invocation started through the supervisor.
pub const PORTAL_REASON: &str = "Portal";

/// Wire form:
/// `{"Type":"CallAndOverride","Id":"<uuid>","FunctionId":"Host.Functions.<name>","Arguments":{"<input>":"<payload>"},"Reason":"Portal"}`.
/// Field order is part of the format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationMessage {
    #[serde(rename = "Type")]
    kind: String,
    id: Uuid,
    function_id: String,
    arguments: BTreeMap<String, String>,
    reason: String,
}

impl InvocationMessage {
    /// New message with a fresh correlation id.
    pub fn new(function_name: &str, input_name: &str, payload: &str) -> Self {
        Self::with_id(Uuid::new_v4(), function_name, input_name, payload)
    }

    pub fn with_id(id: Uuid, function_name: &str, input_name: &str, payload: &str) -> Self {
        Self {
            kind: CALL_AND_OVERRIDE.to_string(),
            id,
            function_id: function_id(function_name),
            arguments: BTreeMap::from([(input_name.to_string(), payload.to_string())]),
            reason: PORTAL_REASON.to_string(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
