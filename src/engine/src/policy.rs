//! Compiled policy model
//!
//! These types are the output of the (external) policy compiler and the input
//! to the rule table. A compiled policy set is immutable once built; the rule
//! table and evaluators share it through `Arc`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::schema::PolicySchemas;

/// Effect of a rule or a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Effect {
    Allow,
    Deny,
    /// The rule matched structurally but did not produce a decision.
    NoMatch,
}

/// How rules in a scope interact with rules in ancestor scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopePermissions {
    /// Not set on the source policy; defaulted to `OverrideParent` at load.
    #[default]
    Unspecified,
    /// Decisions in this scope stand on their own.
    OverrideParent,
    /// An ALLOW in this scope must also be granted by every ancestor scope.
    RequireParentalConsentForAllows,
}

/// Opaque boolean condition tree attached to a rule.
///
/// Leaf expressions are evaluated by the external condition evaluator; the
/// `All`/`Any`/`None` combinators are part of the compiled representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    None(Vec<Condition>),
    Expr(String),
}

impl Condition {
    /// Conjunction of two optional conditions, used when folding a derived
    /// role's condition onto the rule that references it.
    pub fn and(a: Option<Condition>, b: Option<Condition>) -> Option<Condition> {
        match (a, b) {
            (None, None) => None,
            (Some(c), None) | (None, Some(c)) => Some(c),
            (Some(a), Some(b)) => Some(Condition::All(vec![a, b])),
        }
    }
}

/// A named variable whose expression is evaluated before rule conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub expr: String,
}

/// Output emission spec attached to a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    /// Expression emitted when the rule activates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_rule_activated: Option<String>,
    /// Expression emitted when the rule matched but its condition failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_condition_not_met: Option<String>,
}

/// Free-form attributes describing where a policy came from.
pub type SourceAttributes = HashMap<String, Value>;

/// What a policy is named after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyName {
    Resource(String),
    Role(String),
    Principal(String),
}

/// Shared metadata of a compiled policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMeta {
    /// Fully-qualified name of the origin policy.
    pub fqn: String,
    pub name: PolicyName,
    pub version: String,
    #[serde(default)]
    pub source_attributes: SourceAttributes,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// A derived role definition: role aliasing gated by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRoleDef {
    pub name: String,
    /// Base roles the derived role expands to.
    pub parent_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub constants: HashMap<String, Value>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// A single rule in a resource policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub name: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub derived_roles: Vec<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
}

/// One scope level of a compiled resource policy set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicy {
    pub scope: String,
    #[serde(default)]
    pub scope_permissions: ScopePermissions,
    #[serde(default)]
    pub derived_roles: HashMap<String, DerivedRoleDef>,
    #[serde(default)]
    pub constants: HashMap<String, Value>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub rules: Vec<ResourceRule>,
}

/// Compiled resource policy set: one entry per scope, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicySet {
    pub meta: PolicyMeta,
    pub resource: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<PolicySchemas>,
    pub policies: Vec<ResourcePolicy>,
}

/// A single rule in a role policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRule {
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// Compiled role policy set: ALLOW grants for one role at one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePolicySet {
    pub meta: PolicyMeta,
    pub role: String,
    pub scope: String,
    #[serde(default)]
    pub scope_permissions: ScopePermissions,
    #[serde(default)]
    pub parent_roles: Vec<String>,
    /// Resource pattern to the rules granted on it.
    #[serde(default)]
    pub resources: HashMap<String, Vec<RoleRule>>,
}

/// A single action rule in a principal policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalActionRule {
    pub name: String,
    pub action: String,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
}

/// Rules a principal policy grants on one resource pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalResourceRule {
    pub resource: String,
    pub rules: Vec<PrincipalActionRule>,
}

/// One scope level of a compiled principal policy set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalPolicy {
    pub scope: String,
    #[serde(default)]
    pub scope_permissions: ScopePermissions,
    #[serde(default)]
    pub constants: HashMap<String, Value>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub resource_rules: Vec<PrincipalResourceRule>,
}

/// Compiled principal policy set: one entry per scope, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalPolicySet {
    pub meta: PolicyMeta,
    pub principal: String,
    pub version: String,
    pub policies: Vec<PrincipalPolicy>,
}

/// A compiled policy set of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PolicySet {
    Resource(ResourcePolicySet),
    Role(RolePolicySet),
    Principal(PrincipalPolicySet),
}

impl PolicySet {
    /// FQN of the origin policy.
    pub fn fqn(&self) -> &str {
        match self {
            PolicySet::Resource(p) => &p.meta.fqn,
            PolicySet::Role(p) => &p.meta.fqn,
            PolicySet::Principal(p) => &p.meta.fqn,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourcePolicySet> {
        match self {
            PolicySet::Resource(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_role(&self) -> Option<&RolePolicySet> {
        match self {
            PolicySet::Role(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_principal(&self) -> Option<&PrincipalPolicySet> {
        match self {
            PolicySet::Principal(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_and_folds_both_sides() {
        let a = Condition::Expr("request.principal.id == resource.attr.owner".into());
        let b = Condition::Expr("request.resource.attr.status == 'DRAFT'".into());

        assert_eq!(Condition::and(None, None), None);
        assert_eq!(Condition::and(Some(a.clone()), None), Some(a.clone()));
        assert_eq!(
            Condition::and(Some(a.clone()), Some(b.clone())),
            Some(Condition::All(vec![a, b]))
        );
    }

    #[test]
    fn effect_serializes_screaming_snake() {
        assert_eq!(serde_json::to_string(&Effect::Allow).unwrap(), "\"ALLOW\"");
        assert_eq!(
            serde_json::to_string(&Effect::NoMatch).unwrap(),
            "\"NO_MATCH\""
        );
    }

    #[test]
    fn scope_permissions_default_is_unspecified() {
        assert_eq!(ScopePermissions::default(), ScopePermissions::Unspecified);
    }
}
