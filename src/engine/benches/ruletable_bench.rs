//! Rule table scan benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use cretoai_verdict::namer;
use cretoai_verdict::policy::{
    Effect, PolicyMeta, PolicyName, PolicySet, ResourcePolicy, ResourcePolicySet, ResourceRule,
    RolePolicySet, RoleRule, ScopePermissions,
};
use cretoai_verdict::RuleTable;

fn resource_policy(resource: &str, scope: &str, num_rules: usize) -> Arc<PolicySet> {
    let rules = (0..num_rules)
        .map(|i| ResourceRule {
            name: format!("rule_{i}"),
            actions: vec![format!("action_{i}"), "view".to_string()],
            roles: vec![format!("role_{i}"), "employee".to_string()],
            derived_roles: Vec::new(),
            effect: if i % 2 == 0 { Effect::Allow } else { Effect::Deny },
            condition: None,
            output: None,
        })
        .collect();

    Arc::new(PolicySet::Resource(ResourcePolicySet {
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
            scope_permissions: ScopePermissions::Unspecified,
            derived_roles: Default::default(),
            constants: Default::default(),
            variables: Vec::new(),
            rules,
        }],
    }))
}

fn role_policy(role: &str, parent: Option<&str>) -> Arc<PolicySet> {
    let mut resources = std::collections::HashMap::new();
    resources.insert(
        "*".to_string(),
        vec![RoleRule {
            actions: vec!["view".into()],
            condition: None,
        }],
    );
    Arc::new(PolicySet::Role(RolePolicySet {
        meta: PolicyMeta {
            fqn: namer::role_policy_fqn(role, ""),
            name: PolicyName::Role(role.into()),
            version: "default".into(),
            source_attributes: Default::default(),
            annotations: Default::default(),
        },
        role: role.into(),
        scope: "".into(),
        scope_permissions: ScopePermissions::OverrideParent,
        parent_roles: parent.map(|p| vec![p.to_string()]).into_iter().flatten().collect(),
        resources,
    }))
}

fn populated_table() -> RuleTable {
    let table = RuleTable::new();

    let mut sets = Vec::new();
    for i in 0..50 {
        sets.push(resource_policy(&format!("resource_{i}"), "", 20));
    }
    // a ten-deep role chain to exercise ancestor resolution
    for i in 0..10 {
        let parent = if i == 0 { None } else { Some(format!("role_l{}", i - 1)) };
        sets.push(role_policy(&format!("role_l{i}"), parent.as_deref()));
    }
    table.load_policies(&sets);

    table
}

fn bench_scan_rows(c: &mut Criterion) {
    let table = populated_table();
    let scopes = vec![String::new()];
    let roles = vec!["employee".to_string()];
    let actions = vec!["view".to_string()];

    c.bench_function("scan_rows/50_policies", |b| {
        b.iter(|| {
            let rule_set = table.scan_rows(
                black_box("default"),
                black_box("resource_25"),
                &scopes,
                &roles,
                &actions,
            );
            black_box(rule_set.len())
        })
    });
}

fn bench_parent_role_resolution(c: &mut Criterion) {
    let table = populated_table();
    let roles = vec!["role_l9".to_string()];

    c.bench_function("parent_roles/10_deep_chain", |b| {
        b.iter(|| black_box(table.get_parent_roles(black_box(&roles))).len())
    });
}

fn bench_filter(c: &mut Criterion) {
    let table = populated_table();
    let scopes = vec![String::new()];
    let roles = vec!["employee".to_string()];
    let rule_set = table.scan_rows("default", "resource_25", &scopes, &roles, &[]);
    let actions = vec!["view".to_string()];

    c.bench_function("filter/narrow_by_action", |b| {
        b.iter(|| black_box(table.filter(&rule_set, &scopes, &roles, &actions)).len())
    });
}

criterion_group!(
    benches,
    bench_scan_rows,
    bench_parent_role_resolution,
    bench_filter
);
criterion_main!(benches);
