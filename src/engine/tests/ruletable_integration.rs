//! Rule table maintenance: expansion, deletion equivalence, event handling

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cretoai_verdict::policy::{Condition, DerivedRoleDef, Effect, ScopePermissions};
use cretoai_verdict::{MemoryPolicyLoader, RuleTable, StorageEvent, Subscriber};

use common::*;

/// Content signature of a table, independent of row order.
fn row_signature(table: &RuleTable) -> HashSet<(String, String, String, String)> {
    let rule_set = table.scan_rows("", "", &[], &[], &[]);
    rule_set
        .entries()
        .iter()
        .map(|e| {
            (
                e.row.resource.clone(),
                e.row.role.clone(),
                e.row.action.clone(),
                e.row.scope.clone(),
            )
        })
        .collect()
}

#[test]
fn delete_and_re_add_restores_an_equivalent_row_set() {
    let table = RuleTable::new();
    let keep = arc(resource_policy_set(
        "document",
        "",
        vec![resource_rule("allow_view", "view", "employee", Effect::Allow)],
    ));
    let churn = arc(resource_policy_set(
        "leave_request",
        "acme",
        vec![
            resource_rule("allow_view", "view", "employee", Effect::Allow),
            resource_rule("deny_delete", "delete", "employee", Effect::Deny),
        ],
    ));

    table.load_policies(&[keep.clone(), churn.clone()]);
    let before = row_signature(&table);
    assert_eq!(table.len(), 3);

    table.delete_policy(&churn);
    assert_eq!(table.len(), 1);
    let after_delete = row_signature(&table);
    assert!(after_delete.iter().all(|(resource, ..)| resource == "document"));

    table.load_policies(&[churn]);
    assert_eq!(row_signature(&table), before);
}

#[test]
fn derived_role_rows_carry_both_conditions_and_parents() {
    let table = RuleTable::new();

    let mut derived_roles = HashMap::new();
    derived_roles.insert(
        "approver".to_string(),
        DerivedRoleDef {
            name: "approver".into(),
            parent_roles: vec!["p1".into(), "p2".into()],
            condition: Some(Condition::Expr("c2".into())),
            constants: Default::default(),
            variables: Vec::new(),
        },
    );

    let mut rule = resource_rule("approve_rule", "approve", "unused", Effect::Allow);
    rule.roles = Vec::new();
    rule.derived_roles = vec!["approver".into()];
    rule.condition = Some(Condition::Expr("c1".into()));

    table.load_policies(&[arc(resource_policy_set_with(
        "leave_request",
        "",
        ScopePermissions::Unspecified,
        vec![rule],
        derived_roles,
    ))]);

    let rule_set = table.scan_rows("", "", &[], &[], &[]);
    assert_eq!(rule_set.len(), 2);

    let roles: HashSet<&str> = rule_set.entries().iter().map(|e| e.row.role.as_str()).collect();
    assert_eq!(roles, HashSet::from(["p1", "p2"]));

    for entry in rule_set.entries() {
        assert_eq!(entry.row.origin_derived_role.as_deref(), Some("approver"));
        match entry.row.condition.as_deref() {
            Some(Condition::All(parts)) => {
                assert_eq!(
                    parts,
                    &vec![Condition::Expr("c1".into()), Condition::Expr("c2".into())]
                );
            }
            other => panic!("expected ANDed condition, got {other:?}"),
        }
    }
}

#[test]
fn scope_walk_returns_first_policy_identity() {
    let table = RuleTable::new();
    table.load_policies(&[
        arc(resource_policy_set(
            "leave_request",
            "a.b",
            vec![resource_rule("r", "view", "employee", Effect::Allow)],
        )),
        arc(resource_policy_set(
            "leave_request",
            "",
            vec![resource_rule("r", "view", "employee", Effect::Allow)],
        )),
    ]);

    let (scopes, first_key, _) = table.get_all_scopes("a.b.c", "leave_request", "default");
    assert_eq!(scopes, vec!["a.b".to_string(), String::new()]);
    assert_eq!(first_key, "resource.leave_request.vdefault/a.b");
}

#[tokio::test]
async fn subscriber_applies_storage_events() {
    let loader = Arc::new(MemoryPolicyLoader::new());
    let table = RuleTable::new().with_policy_loader(loader.clone());

    let policy = resource_policy_set(
        "leave_request",
        "",
        vec![resource_rule("allow_view", "view", "employee", Effect::Allow)],
    );
    let id = loader.put(policy).await;

    assert_eq!(table.subscriber_id(), "engine.ruletable");

    table
        .on_storage_event(&[StorageEvent::add_or_update(id.clone())])
        .await;
    assert_eq!(table.len(), 1);

    loader.remove(&id).await;
    table
        .on_storage_event(&[StorageEvent::delete_or_disable(id)])
        .await;
    assert!(table.is_empty());
}

#[tokio::test]
async fn reload_event_rebuilds_from_the_snapshot() {
    let loader = Arc::new(MemoryPolicyLoader::new());
    let table = RuleTable::new().with_policy_loader(loader.clone());

    loader
        .put(resource_policy_set(
            "leave_request",
            "",
            vec![resource_rule("allow_view", "view", "employee", Effect::Allow)],
        ))
        .await;
    loader
        .put(resource_policy_set(
            "document",
            "",
            vec![resource_rule("allow_view", "view", "employee", Effect::Allow)],
        ))
        .await;

    table.on_storage_event(&[StorageEvent::reload()]).await;
    assert_eq!(table.len(), 2);

    // a second reload after the store shrinks drops the removed rows
    let gone = loader
        .put(resource_policy_set(
            "document",
            "",
            vec![resource_rule("allow_view", "view", "employee", Effect::Allow)],
        ))
        .await;
    loader.remove(&gone).await;

    table.on_storage_event(&[StorageEvent::reload()]).await;
    assert_eq!(table.len(), 1);
}
