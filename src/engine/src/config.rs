//! Engine configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default policy version applied when a request does not name one.
pub const DEFAULT_POLICY_VERSION: &str = "default";

/// Engine configuration.
///
/// Deserializable so embedders can load it from their own config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConf {
    /// Number of worker tasks for parallel batch checks. Zero disables the
    /// worker pool; all batches then run serially.
    pub num_workers: usize,

    /// Policy version used when a request leaves it empty.
    pub default_policy_version: String,

    /// Whether policy lookups fall back to ancestor scopes when no policy
    /// exists at the requested scope.
    pub lenient_scope_search: bool,

    /// Global variables exposed to every condition evaluation.
    pub globals: HashMap<String, Value>,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            default_policy_version: DEFAULT_POLICY_VERSION.to_string(),
            lenient_scope_search: false,
            globals: HashMap::new(),
        }
    }
}
