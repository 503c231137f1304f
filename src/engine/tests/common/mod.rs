//! Shared builders for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use cretoai_verdict::policy::{
    Condition, DerivedRoleDef, Effect, PolicyMeta, PolicyName, PolicySet, PrincipalActionRule,
    PrincipalPolicy, PrincipalPolicySet, PrincipalResourceRule, ResourcePolicy, ResourcePolicySet,
    ResourceRule, RolePolicySet, RoleRule, ScopePermissions,
};
use cretoai_verdict::{namer, CheckInput, Principal, Resource};

pub fn resource_rule(name: &str, action: &str, role: &str, effect: Effect) -> ResourceRule {
    ResourceRule {
        name: name.into(),
        actions: vec![action.into()],
        roles: vec![role.into()],
        derived_roles: Vec::new(),
        effect,
        condition: None,
        output: None,
    }
}

pub fn conditional_rule(
    name: &str,
    action: &str,
    role: &str,
    effect: Effect,
    expr: &str,
) -> ResourceRule {
    let mut rule = resource_rule(name, action, role, effect);
    rule.condition = Some(Condition::Expr(expr.into()));
    rule
}

pub fn resource_policy_set(resource: &str, scope: &str, rules: Vec<ResourceRule>) -> PolicySet {
    resource_policy_set_with(resource, scope, ScopePermissions::Unspecified, rules, HashMap::new())
}

pub fn resource_policy_set_with(
    resource: &str,
    scope: &str,
    scope_permissions: ScopePermissions,
    rules: Vec<ResourceRule>,
    derived_roles: HashMap<String, DerivedRoleDef>,
) -> PolicySet {
    PolicySet::Resource(ResourcePolicySet {
        meta: PolicyMeta {
            fqn: namer::resource_policy_fqn(resource, "default", scope),
            name: PolicyName::Resource(resource.into()),
            version: "default".into(),
            source_attributes: Default::default(),
            annotations: Default::default(),
        },
        resource: resource.into(),
        version: "default".into(),
        schemas: None,
        policies: vec![ResourcePolicy {
            scope: scope.into(),
            scope_permissions,
            derived_roles,
            constants: Default::default(),
            variables: Vec::new(),
            rules,
        }],
    })
}

pub fn role_policy_set(
    role: &str,
    scope: &str,
    scope_permissions: ScopePermissions,
    parent_roles: Vec<String>,
    resources: Vec<(&str, Vec<RoleRule>)>,
) -> PolicySet {
    PolicySet::Role(RolePolicySet {
        meta: PolicyMeta {
            fqn: namer::role_policy_fqn(role, scope),
            name: PolicyName::Role(role.into()),
            version: "default".into(),
            source_attributes: Default::default(),
            annotations: Default::default(),
        },
        role: role.into(),
        scope: scope.into(),
        scope_permissions,
        parent_roles,
        resources: resources
            .into_iter()
            .map(|(resource, rules)| (resource.to_string(), rules))
            .collect(),
    })
}

pub fn role_rule(actions: &[&str]) -> RoleRule {
    RoleRule {
        actions: actions.iter().map(|a| a.to_string()).collect(),
        condition: None,
    }
}

pub fn principal_policy_set(
    principal: &str,
    scope: &str,
    rules: Vec<(&str, &str, Effect)>,
) -> PolicySet {
    PolicySet::Principal(PrincipalPolicySet {
        meta: PolicyMeta {
            fqn: namer::principal_policy_fqn(principal, "default", scope),
            name: PolicyName::Principal(principal.into()),
            version: "default".into(),
            source_attributes: Default::default(),
            annotations: Default::default(),
        },
        principal: principal.into(),
        version: "default".into(),
        policies: vec![PrincipalPolicy {
            scope: scope.into(),
            scope_permissions: ScopePermissions::Unspecified,
            constants: Default::default(),
            variables: Vec::new(),
            resource_rules: rules
                .into_iter()
                .map(|(resource, action, effect)| PrincipalResourceRule {
                    resource: resource.into(),
                    rules: vec![PrincipalActionRule {
                        name: format!("{action}_rule"),
                        action: action.into(),
                        effect,
                        condition: None,
                        output: None,
                    }],
                })
                .collect(),
        }],
    })
}

pub fn check_input(id: &str, principal: &str, roles: &[&str], actions: &[&str]) -> CheckInput {
    CheckInput {
        request_id: id.into(),
        principal: Principal::new(principal, roles.iter().map(|r| r.to_string()).collect()),
        resource: Resource::new("leave_request", id),
        actions: actions.iter().map(|a| a.to_string()).collect(),
    }
}

pub fn arc(set: PolicySet) -> Arc<PolicySet> {
    Arc::new(set)
}
