//! Fully-qualified policy names and module identifiers
//!
//! Every compiled policy is addressed by a deterministic FQN. The FQN doubles
//! as the module identifier used by the policy loader and as the origin tag
//! on rule table rows.

use serde::{Deserialize, Serialize};

const FQN_PREFIX: &str = "verdict";
const DEFAULT_VERSION: &str = "default";

/// Identifies a compiled policy module in the policy store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn from_fqn(fqn: impl Into<String>) -> Self {
        Self(fqn.into())
    }

    pub fn fqn(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a resource name for use in FQNs and rule rows.
pub fn sanitized_resource(resource: &str) -> String {
    resource.trim().replace('/', ".")
}

fn scope_suffix(scope: &str) -> String {
    if scope.is_empty() {
        String::new()
    } else {
        format!("/{scope}")
    }
}

/// FQN of the resource policy for `resource` at `version` and `scope`.
pub fn resource_policy_fqn(resource: &str, version: &str, scope: &str) -> String {
    let version = if version.is_empty() { DEFAULT_VERSION } else { version };
    format!(
        "{FQN_PREFIX}.resource.{}.v{version}{}",
        sanitized_resource(resource),
        scope_suffix(scope)
    )
}

/// FQN of the principal policy for `principal` at `version` and `scope`.
pub fn principal_policy_fqn(principal: &str, version: &str, scope: &str) -> String {
    let version = if version.is_empty() { DEFAULT_VERSION } else { version };
    format!(
        "{FQN_PREFIX}.principal.{principal}.v{version}{}",
        scope_suffix(scope)
    )
}

/// FQN of the role policy for `role` at `scope`.
pub fn role_policy_fqn(role: &str, scope: &str) -> String {
    format!("{FQN_PREFIX}.role.{role}{}", scope_suffix(scope))
}

/// FQN of a named derived-roles definition.
pub fn derived_roles_fqn(name: &str) -> String {
    format!("{FQN_PREFIX}.derived_roles.{name}")
}

/// FQN of a single rule within a policy.
pub fn rule_fqn(policy_fqn: &str, scope: &str, rule_name: &str) -> String {
    let _ = scope;
    format!("{policy_fqn}#{rule_name}")
}

/// Human-readable policy key derived from an FQN.
pub fn policy_key_from_fqn(fqn: &str) -> String {
    fqn.strip_prefix(&format!("{FQN_PREFIX}."))
        .unwrap_or(fqn)
        .to_string()
}

/// Module id of the role policy for `role` at `scope`.
pub fn role_policy_module_id(role: &str, scope: &str) -> ModuleId {
    ModuleId::from_fqn(role_policy_fqn(role, scope))
}

/// Walks `scope` from most specific to the empty root, yielding each prefix.
///
/// `"a.b.c"` yields `["a.b.c", "a.b", "a", ""]`.
pub fn scope_chain(scope: &str) -> Vec<String> {
    let mut chain = Vec::with_capacity(4);
    chain.push(scope.to_string());
    let bytes = scope.as_bytes();
    for i in (0..scope.len()).rev() {
        if bytes[i] == b'.' || i == 0 {
            chain.push(scope[..i].to_string());
        }
    }
    chain
}

/// Module ids for a scoped principal policy lookup, most specific first.
///
/// With lenient scope search, every ancestor scope is a candidate; otherwise
/// only the requested scope is considered.
pub fn scoped_principal_policy_module_ids(
    principal: &str,
    version: &str,
    scope: &str,
    lenient_scope_search: bool,
) -> Vec<ModuleId> {
    scoped_module_ids(scope, lenient_scope_search, |s| {
        principal_policy_fqn(principal, version, s)
    })
}

/// Module ids for a scoped resource policy lookup, most specific first.
pub fn scoped_resource_policy_module_ids(
    resource: &str,
    version: &str,
    scope: &str,
    lenient_scope_search: bool,
) -> Vec<ModuleId> {
    scoped_module_ids(scope, lenient_scope_search, |s| {
        resource_policy_fqn(resource, version, s)
    })
}

fn scoped_module_ids(
    scope: &str,
    lenient_scope_search: bool,
    fqn_for: impl Fn(&str) -> String,
) -> Vec<ModuleId> {
    if !lenient_scope_search {
        return vec![ModuleId::from_fqn(fqn_for(scope))];
    }

    scope_chain(scope)
        .iter()
        .map(|s| ModuleId::from_fqn(fqn_for(s)))
        .collect()
}
