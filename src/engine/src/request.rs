//! Check request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::policy::Effect;
use crate::schema::ValidationError;

/// Principal making a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Principal identifier (e.g., "alice", "service:billing").
    pub id: String,

    /// Base roles held by the principal.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Policy version to match; empty means the engine default.
    #[serde(default)]
    pub policy_version: String,

    /// Scope the principal is acting within.
    #[serde(default)]
    pub scope: String,

    /// Additional attributes consulted by conditions.
    #[serde(default)]
    pub attr: HashMap<String, Value>,
}

impl Principal {
    pub fn new(id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            id: id.into(),
            roles,
            policy_version: String::new(),
            scope: String::new(),
            attr: HashMap::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attr.insert(key.into(), value);
        self
    }
}

/// Resource a request targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource kind; matched against resource policy names.
    pub kind: String,

    /// Instance identifier.
    pub id: String,

    /// Policy version to match; empty means the engine default.
    #[serde(default)]
    pub policy_version: String,

    /// Scope the resource lives in.
    #[serde(default)]
    pub scope: String,

    /// Additional attributes consulted by conditions.
    #[serde(default)]
    pub attr: HashMap<String, Value>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            policy_version: String::new(),
            scope: String::new(),
            attr: HashMap::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attr.insert(key.into(), value);
        self
    }
}

/// A single authorization check request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInput {
    #[serde(default)]
    pub request_id: String,
    pub principal: Principal,
    pub resource: Resource,
    pub actions: Vec<String>,
}

/// Effect resolved for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEffect {
    pub effect: Effect,
    /// Key of the policy that produced the decision, or "NO_MATCH".
    pub policy: String,
    /// Scope the deciding rule belonged to.
    #[serde(default)]
    pub scope: String,
}

/// Output emitted by a rule during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEntry {
    /// Evaluation key of the rule that produced the output.
    pub src: String,
    pub val: Value,
}

/// Result of evaluating one [`CheckInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutput {
    #[serde(default)]
    pub request_id: String,
    pub resource_id: String,
    pub actions: HashMap<String, ActionEffect>,
    #[serde(default)]
    pub effective_derived_roles: Vec<String>,
    #[serde(default)]
    pub validation_errors: Vec<ValidationError>,
    #[serde(default)]
    pub outputs: Vec<OutputEntry>,
}
