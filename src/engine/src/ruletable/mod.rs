//! Rule table: normalized, incrementally-maintained index of compiled policy
//! rules
//!
//! Resource and role policies are expanded into flat rule rows at load time;
//! requests are answered by scanning the rows with independent filter
//! predicates. The table also owns the scope-existence set, per-scope
//! permission modes, the role-hierarchy adjacency map, and per-policy schema
//! references. All of these live behind a single read/write lock so their
//! cross-field invariants hold atomically.

pub mod row;

pub use row::{RowParams, RuleSet, RuleSetEntry, RuleTableRow};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::loader::{EventKind, PolicyLoader, StorageEvent, Subscriber};
use crate::matcher::{matches_any, matches_glob};
use crate::namer;
use crate::policy::{
    Condition, DerivedRoleDef, Effect, PolicyMeta, PolicyName, PolicySet, ResourcePolicySet,
    RolePolicySet, ScopePermissions,
};
use crate::schema::PolicySchemas;

const STORE_RELOAD_TIMEOUT: Duration = Duration::from_secs(5);
const STORE_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Derived-role definitions declared by one scoped resource policy, with
/// their constants already materialized as native values.
#[derive(Debug, Clone)]
struct DerivedRolesEntry {
    origin_fqn: String,
    roles: HashMap<String, Arc<DerivedRoleDef>>,
}

/// Everything the table owns, guarded together.
#[derive(Default)]
struct TableState {
    rules: Vec<Arc<RuleTableRow>>,
    schemas: HashMap<String, PolicySchemas>,
    policy_derived_roles: HashMap<String, DerivedRolesEntry>,
    scope_map: HashSet<String>,
    scope_scope_permissions: HashMap<String, ScopePermissions>,
    parent_roles: HashMap<String, Vec<String>>,
    /// Role policy FQN to the role it declares, for delete-by-id cleanup.
    role_policy_origins: HashMap<String, String>,
}

/// Mutable, concurrently-readable rule index.
pub struct RuleTable {
    state: RwLock<TableState>,
    /// Memoized role to ancestor-closure cache. Lives beside the locked
    /// aggregate: scans populate it under the read lock, which is safe
    /// because the memoization is idempotent. Invalidated wholesale on any
    /// role-policy deletion.
    parent_role_ancestors: DashMap<String, Arc<Vec<String>>>,
    policy_loader: Option<Arc<dyn PolicyLoader>>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            parent_role_ancestors: DashMap::new(),
            policy_loader: None,
        }
    }

    pub fn with_policy_loader(mut self, loader: Arc<dyn PolicyLoader>) -> Self {
        self.policy_loader = Some(loader);
        self
    }

    /// Loads compiled policy sets into the table.
    ///
    /// Principal policies are not indexed; they are fetched per request and
    /// evaluated directly.
    pub fn load_policies(&self, sets: &[Arc<PolicySet>]) {
        let mut state = self.state.write();
        for set in sets {
            Self::add_policy(&mut state, set);
        }
    }

    fn add_policy(state: &mut TableState, set: &PolicySet) {
        match set {
            PolicySet::Resource(rp) => Self::add_resource_policy(state, rp),
            PolicySet::Role(rp) => Self::add_role_policy(state, rp),
            PolicySet::Principal(_) => {
                debug!(fqn = set.fqn(), "Skipping principal policy; not indexed");
            }
        }
    }

    fn add_resource_policy(state: &mut TableState, rps: &ResourcePolicySet) {
        let sanitized_resource = namer::sanitized_resource(&rps.resource);

        let meta = Arc::new(PolicyMeta {
            fqn: rps.meta.fqn.clone(),
            name: PolicyName::Resource(sanitized_resource.clone()),
            version: rps.version.clone(),
            source_attributes: rps.meta.source_attributes.clone(),
            annotations: rps.meta.annotations.clone(),
        });

        if let Some(schemas) = &rps.schemas {
            state.schemas.insert(rps.meta.fqn.clone(), schemas.clone());
        }

        for p in &rps.policies {
            let scope_fqn = namer::resource_policy_fqn(&rps.resource, &rps.version, &p.scope);
            state.policy_derived_roles.insert(
                scope_fqn,
                DerivedRolesEntry {
                    origin_fqn: rps.meta.fqn.clone(),
                    roles: p
                        .derived_roles
                        .iter()
                        .map(|(name, def)| (name.clone(), Arc::new(def.clone())))
                        .collect(),
                },
            );

            state.scope_map.insert(p.scope.clone());

            let policy_params = Arc::new(RowParams {
                key: namer::resource_policy_fqn(&sanitized_resource, &rps.version, &p.scope),
                constants: p.constants.clone(),
                variables: p.variables.clone(),
            });

            let scope_permissions = match p.scope_permissions {
                ScopePermissions::Unspecified => ScopePermissions::OverrideParent,
                other => other,
            };
            state
                .scope_scope_permissions
                .insert(p.scope.clone(), scope_permissions);

            for rule in &p.rules {
                let condition = rule.condition.clone().map(Arc::new);
                let output = rule.output.clone().map(Arc::new);
                let evaluation_key = format!("{}#{}", policy_params.key, rule.name);

                for action in &rule.actions {
                    for role in &rule.roles {
                        state.rules.push(Arc::new(RuleTableRow {
                            origin_fqn: rps.meta.fqn.clone(),
                            resource: sanitized_resource.clone(),
                            role: role.clone(),
                            action: action.clone(),
                            condition: condition.clone(),
                            effect: rule.effect,
                            scope: p.scope.clone(),
                            scope_permissions,
                            version: rps.version.clone(),
                            origin_derived_role: None,
                            output: output.clone(),
                            name: rule.name.clone(),
                            meta: meta.clone(),
                            params: Some(policy_params.clone()),
                            evaluation_key: evaluation_key.clone(),
                        }));
                    }

                    // merge derived roles as roles with added conditions
                    for dr_name in &rule.derived_roles {
                        let Some(rdr) = p.derived_roles.get(dr_name) else {
                            continue;
                        };

                        let mut merged_variables =
                            Vec::with_capacity(p.variables.len() + rdr.variables.len());
                        merged_variables.extend(p.variables.iter().cloned());
                        merged_variables.extend(rdr.variables.iter().cloned());

                        let mut merged_constants = p.constants.clone();
                        for (k, v) in &rdr.constants {
                            merged_constants.insert(k.clone(), v.clone());
                        }

                        let merged_params = Arc::new(RowParams {
                            key: format!(
                                "{}:{}",
                                policy_params.key,
                                namer::derived_roles_fqn(&rdr.name)
                            ),
                            constants: merged_constants,
                            variables: merged_variables,
                        });

                        let merged_condition =
                            Condition::and(rule.condition.clone(), rdr.condition.clone())
                                .map(Arc::new);
                        let evaluation_key = format!("{}#{}", merged_params.key, rule.name);

                        for parent_role in &rdr.parent_roles {
                            state.rules.push(Arc::new(RuleTableRow {
                                origin_fqn: rps.meta.fqn.clone(),
                                resource: sanitized_resource.clone(),
                                role: parent_role.clone(),
                                action: action.clone(),
                                condition: merged_condition.clone(),
                                effect: rule.effect,
                                scope: p.scope.clone(),
                                scope_permissions,
                                version: rps.version.clone(),
                                origin_derived_role: Some(dr_name.clone()),
                                output: output.clone(),
                                name: rule.name.clone(),
                                meta: meta.clone(),
                                params: Some(merged_params.clone()),
                                evaluation_key: evaluation_key.clone(),
                            }));
                        }
                    }
                }
            }
        }
    }

    fn add_role_policy(state: &mut TableState, p: &RolePolicySet) {
        state.scope_map.insert(p.scope.clone());
        state
            .scope_scope_permissions
            .insert(p.scope.clone(), p.scope_permissions);

        let version = "default".to_string();
        let meta = Arc::new(PolicyMeta {
            fqn: p.meta.fqn.clone(),
            name: PolicyName::Role(p.role.clone()),
            version: version.clone(),
            source_attributes: p.meta.source_attributes.clone(),
            annotations: p.meta.annotations.clone(),
        });

        let policy_key = namer::policy_key_from_fqn(&namer::role_policy_fqn(&p.role, &p.scope));
        for (resource, rules) in &p.resources {
            for (idx, rule) in rules.iter().enumerate() {
                let condition = rule.condition.clone().map(Arc::new);
                let evaluation_key = format!("{policy_key}#{}_rule-{idx:03}", p.role);
                for action in &rule.actions {
                    state.rules.push(Arc::new(RuleTableRow {
                        origin_fqn: p.meta.fqn.clone(),
                        resource: resource.clone(),
                        role: p.role.clone(),
                        action: action.clone(),
                        condition: condition.clone(),
                        effect: Effect::Allow,
                        scope: p.scope.clone(),
                        scope_permissions: p.scope_permissions,
                        version: version.clone(),
                        origin_derived_role: None,
                        output: None,
                        name: format!("{}_rule-{idx:03}", p.role),
                        meta: meta.clone(),
                        params: None,
                        evaluation_key: evaluation_key.clone(),
                    }));
                }
            }
        }

        state.parent_roles.insert(p.role.clone(), p.parent_roles.clone());
        state
            .role_policy_origins
            .insert(p.meta.fqn.clone(), p.role.clone());
    }

    /// Removes every row originating from `set` and the indices derived from
    /// it.
    pub fn delete_policy(&self, set: &PolicySet) {
        self.delete_policy_by_fqn(set.fqn());
    }

    /// Removes every row whose origin is `fqn`.
    ///
    /// The row collection is rebuilt by a full scan, as in the original
    /// index. Scopes left without any rows are dropped together with their
    /// scope-permission entries.
    pub fn delete_policy_by_fqn(&self, fqn: &str) {
        let mut state = self.state.write();

        let mut surviving_scopes: HashSet<String> = HashSet::new();
        let mut new_rules = Vec::with_capacity(state.rules.len());
        for row in state.rules.drain(..) {
            if row.origin_fqn != fqn {
                surviving_scopes.insert(row.scope.clone());
                new_rules.push(row);
            }
        }
        state.rules = new_rules;

        state.schemas.remove(fqn);
        state
            .policy_derived_roles
            .retain(|_, entry| entry.origin_fqn != fqn);

        if let Some(role) = state.role_policy_origins.remove(fqn) {
            state.parent_roles.remove(&role);
            // Roles that transitively depended on the deleted role would
            // otherwise keep stale closures, so the whole cache goes.
            self.parent_role_ancestors.clear();
        }

        state.scope_map.retain(|s| surviving_scopes.contains(s));
        state
            .scope_scope_permissions
            .retain(|s, _| surviving_scopes.contains(s));
    }

    /// Drops every row and derived index.
    pub fn purge(&self) {
        let mut state = self.state.write();
        *state = TableState::default();
        self.parent_role_ancestors.clear();
    }

    pub fn scope_exists(&self, scope: &str) -> bool {
        self.state.read().scope_map.contains(scope)
    }

    /// Scope-permission mode recorded for `scope`.
    pub fn get_scope_scope_permissions(&self, scope: &str) -> ScopePermissions {
        self.state
            .read()
            .scope_scope_permissions
            .get(scope)
            .copied()
            .unwrap_or_default()
    }

    pub fn get_schema(&self, fqn: &str) -> Option<PolicySchemas> {
        self.state.read().schemas.get(fqn).cloned()
    }

    /// Derived-role definitions declared by the scoped policy identified by
    /// `scope_fqn`.
    pub fn get_derived_roles(&self, scope_fqn: &str) -> Option<HashMap<String, Arc<DerivedRoleDef>>> {
        self.state
            .read()
            .policy_derived_roles
            .get(scope_fqn)
            .map(|entry| entry.roles.clone())
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        self.state.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().rules.is_empty()
    }

    /// Walks the dot-delimited `scope` from most specific to the empty root,
    /// returning the existing scopes in that order plus the FQN and policy
    /// key of the first (most specific) hit.
    pub fn get_all_scopes(
        &self,
        scope: &str,
        resource: &str,
        version: &str,
    ) -> (Vec<String>, String, String) {
        let state = self.state.read();

        let mut scopes = Vec::new();
        let mut first_policy_key = String::new();
        let mut first_fqn = String::new();

        for candidate in namer::scope_chain(scope) {
            if state.scope_map.contains(&candidate) {
                if first_policy_key.is_empty() {
                    first_fqn = namer::resource_policy_fqn(resource, version, &candidate);
                    first_policy_key = namer::policy_key_from_fqn(&first_fqn);
                }
                scopes.push(candidate);
            }
        }

        (scopes, first_policy_key, first_fqn)
    }

    /// Full-table scan with independent filter predicates.
    ///
    /// Roles are matched against the requested roles expanded to their
    /// ancestor closure; a row matched only through an ancestor carries the
    /// first requested role as its effective role so that subsequent
    /// [`RuleTable::filter`] passes need not re-resolve ancestors.
    pub fn scan_rows(
        &self,
        version: &str,
        resource: &str,
        scopes: &[String],
        roles: &[String],
        actions: &[String],
    ) -> RuleSet {
        let state = self.state.read();

        let mut result = RuleSet::new();
        let scope_set: HashSet<&str> = scopes.iter().map(String::as_str).collect();
        let parent_roles = self.parent_roles_closure(&state, roles);

        for row in &state.rules {
            if !version.is_empty() && version != row.version {
                continue;
            }

            if !scopes.is_empty() && !scope_set.contains(row.scope.as_str()) {
                continue;
            }

            if !resource.is_empty() && !matches_glob(&row.resource, resource) {
                continue;
            }

            if !actions.is_empty() && !matches_any(&row.action, actions) {
                continue;
            }

            let mut effective_role = None;
            if !roles.is_empty() && !matches_any(&row.role, roles) {
                if matches_any(&row.role, &parent_roles) {
                    effective_role = Some(roles[0].clone());
                } else {
                    continue;
                }
            }

            result.add_matching_row(row.clone(), effective_role);
        }

        result
    }

    /// Narrows an existing rule set without rescanning the table.
    pub fn filter(
        &self,
        rule_set: &RuleSet,
        scopes: &[String],
        roles: &[String],
        actions: &[String],
    ) -> RuleSet {
        let state = self.state.read();
        let parent_roles = self.parent_roles_closure(&state, roles);
        drop(state);

        let mut result = RuleSet::new();

        let scopes: Vec<String> = if scopes.is_empty() {
            rule_set.scopes().map(str::to_string).collect()
        } else {
            scopes.to_vec()
        };

        for scope in &scopes {
            for entry in rule_set.entries_for_scope(scope) {
                if !actions.is_empty() && !matches_any(&entry.row.action, actions) {
                    continue;
                }

                let role = entry.role();
                if roles.is_empty() || matches_any(role, roles) {
                    result.add_matching_row(entry.row.clone(), entry.effective_role.clone());
                } else if matches_any(role, &parent_roles) {
                    result.add_matching_row(entry.row.clone(), Some(roles[0].clone()));
                }
            }
        }

        result
    }

    /// The requested roles plus their recursively resolved ancestor roles.
    pub fn get_parent_roles(&self, roles: &[String]) -> Vec<String> {
        let state = self.state.read();
        self.parent_roles_closure(&state, roles)
    }

    fn parent_roles_closure(&self, state: &TableState, roles: &[String]) -> Vec<String> {
        let mut parent_roles: Vec<String> = roles.to_vec();
        for role in roles {
            let ancestors = if let Some(cached) = self.parent_role_ancestors.get(role) {
                cached.clone()
            } else {
                let mut ancestor_set = HashSet::new();
                let mut visited = HashSet::new();
                Self::collect_parent_roles(state, role, &mut ancestor_set, &mut visited);
                let ancestors: Arc<Vec<String>> = Arc::new(ancestor_set.into_iter().collect());
                self.parent_role_ancestors
                    .insert(role.clone(), ancestors.clone());
                ancestors
            };
            parent_roles.extend(ancestors.iter().cloned());
        }
        parent_roles
    }

    fn collect_parent_roles(
        state: &TableState,
        role: &str,
        ancestor_set: &mut HashSet<String>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(role.to_string()) {
            return;
        }

        if let Some(parents) = state.parent_roles.get(role) {
            for parent in parents {
                ancestor_set.insert(parent.clone());
                Self::collect_parent_roles(state, parent, ancestor_set, visited);
            }
        }
    }

    /// Purges the table and reloads the full snapshot from the policy
    /// loader, bounded by the reload timeout.
    pub async fn trigger_reload(&self) -> Result<()> {
        let loader = self
            .policy_loader
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no policy loader configured".into()))?;

        let sets = tokio::time::timeout(STORE_RELOAD_TIMEOUT, loader.get_all())
            .await
            .map_err(|_| EngineError::Timeout("policy store reload".into()))??;

        self.purge();
        self.load_policies(&sets);

        Ok(())
    }

    /// Applies a single add/update/delete event, bounded by the fetch
    /// timeout.
    pub async fn process_policy_event(&self, event: &StorageEvent) -> Result<()> {
        let Some(policy_id) = &event.policy_id else {
            return Err(EngineError::InvalidInput(
                "storage event is missing a policy id".into(),
            ));
        };

        let loader = self
            .policy_loader
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no policy loader configured".into()))?;

        let fetched = tokio::time::timeout(
            STORE_FETCH_TIMEOUT,
            loader.get_first_match(std::slice::from_ref(policy_id)),
        )
        .await
        .map_err(|_| EngineError::Timeout("policy store fetch".into()))??;

        match fetched {
            Some(set) => {
                self.delete_policy(&set);
                if event.kind == EventKind::AddOrUpdatePolicy {
                    self.load_policies(std::slice::from_ref(&set));
                }
            }
            None => self.delete_policy_by_fqn(policy_id.fqn()),
        }

        Ok(())
    }
}

#[async_trait]
impl Subscriber for RuleTable {
    fn subscriber_id(&self) -> &'static str {
        "engine.ruletable"
    }

    async fn on_storage_event(&self, events: &[StorageEvent]) {
        for event in events {
            match event.kind {
                EventKind::Reload => {
                    info!("Reloading ruletable");
                    if let Err(err) = self.trigger_reload().await {
                        warn!(error = %err, "Failed to reload ruletable");
                    }
                }
                EventKind::AddOrUpdatePolicy | EventKind::DeleteOrDisablePolicy => {
                    debug!(?event, "Processing storage event");
                    if let Err(err) = self.process_policy_event(event).await {
                        warn!(?event, error = %err, "Error while processing storage event");
                    }
                }
                EventKind::Other => {
                    debug!(?event, "Ignoring storage event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ResourcePolicy, ResourceRule, RoleRule};
    use std::collections::HashMap;

    fn resource_policy_set(
        resource: &str,
        scope: &str,
        rules: Vec<ResourceRule>,
        derived_roles: HashMap<String, DerivedRoleDef>,
    ) -> Arc<PolicySet> {
        Arc::new(PolicySet::Resource(ResourcePolicySet {
            meta: PolicyMeta {
                fqn: namer::resource_policy_fqn(resource, "default", scope),
                name: PolicyName::Resource(resource.to_string()),
                version: "default".into(),
                source_attributes: Default::default(),
                annotations: Default::default(),
            },
            resource: resource.to_string(),
            version: "default".into(),
            schemas: None,
            policies: vec![ResourcePolicy {
                scope: scope.to_string(),
                scope_permissions: ScopePermissions::Unspecified,
                derived_roles,
                constants: Default::default(),
                variables: Vec::new(),
                rules,
            }],
        }))
    }

    fn role_policy_set(role: &str, scope: &str, parents: Vec<String>) -> Arc<PolicySet> {
        let mut resources = HashMap::new();
        resources.insert(
            "*".to_string(),
            vec![RoleRule {
                actions: vec!["view".into()],
                condition: None,
            }],
        );
        Arc::new(PolicySet::Role(RolePolicySet {
            meta: PolicyMeta {
                fqn: namer::role_policy_fqn(role, scope),
                name: PolicyName::Role(role.to_string()),
                version: "default".into(),
                source_attributes: Default::default(),
                annotations: Default::default(),
            },
            role: role.to_string(),
            scope: scope.to_string(),
            scope_permissions: ScopePermissions::OverrideParent,
            parent_roles: parents,
            resources,
        }))
    }

    fn simple_rule(name: &str, action: &str, role: &str, effect: Effect) -> ResourceRule {
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

    #[test]
    fn load_expands_action_role_pairs() {
        let table = RuleTable::new();
        let mut rule = simple_rule("r1", "view", "employee", Effect::Allow);
        rule.actions.push("edit".into());
        rule.roles.push("manager".into());

        table.load_policies(&[resource_policy_set(
            "leave_request",
            "",
            vec![rule],
            HashMap::new(),
        )]);

        // 2 actions x 2 roles
        assert_eq!(table.len(), 4);
        assert!(table.scope_exists(""));
        assert_eq!(
            table.get_scope_scope_permissions(""),
            ScopePermissions::OverrideParent
        );
    }

    #[test]
    fn derived_roles_expand_to_parent_roles_with_anded_conditions() {
        let table = RuleTable::new();

        let mut derived = HashMap::new();
        derived.insert(
            "owner".to_string(),
            DerivedRoleDef {
                name: "owner".into(),
                parent_roles: vec!["employee".into(), "contractor".into()],
                condition: Some(Condition::Expr(
                    "request.principal.id == request.resource.attr.owner".into(),
                )),
                constants: Default::default(),
                variables: Vec::new(),
            },
        );

        let rule = ResourceRule {
            name: "r1".into(),
            actions: vec!["edit".into()],
            roles: Vec::new(),
            derived_roles: vec!["owner".into()],
            effect: Effect::Allow,
            condition: Some(Condition::Expr("resource.attr.status == 'DRAFT'".into())),
            output: None,
        };

        table.load_policies(&[resource_policy_set(
            "leave_request",
            "",
            vec![rule],
            derived,
        )]);

        assert_eq!(table.len(), 2);
        let rule_set = table.scan_rows(
            "default",
            "leave_request",
            &[],
            &["employee".into()],
            &["edit".into()],
        );
        assert_eq!(rule_set.len(), 1);

        let entry = &rule_set.entries()[0];
        assert_eq!(entry.row.origin_derived_role.as_deref(), Some("owner"));
        match entry.row.condition.as_deref() {
            Some(Condition::All(children)) => assert_eq!(children.len(), 2),
            other => panic!("expected ANDed condition, got {other:?}"),
        }
        // the derived-role parameter key folds in the derived-roles FQN
        assert!(entry
            .row
            .params
            .as_ref()
            .unwrap()
            .key
            .contains("derived_roles.owner"));
    }

    #[test]
    fn delete_removes_only_matching_origin() {
        let table = RuleTable::new();
        let doc = resource_policy_set(
            "document",
            "",
            vec![simple_rule("r1", "view", "employee", Effect::Allow)],
            HashMap::new(),
        );
        let leave = resource_policy_set(
            "leave_request",
            "acme",
            vec![simple_rule("r1", "view", "employee", Effect::Allow)],
            HashMap::new(),
        );

        table.load_policies(&[doc.clone(), leave.clone()]);
        assert_eq!(table.len(), 2);
        assert!(table.scope_exists(""));
        assert!(table.scope_exists("acme"));

        table.delete_policy(&leave);
        assert_eq!(table.len(), 1);
        assert!(table.scope_exists(""));
        assert!(!table.scope_exists("acme"));

        // re-adding restores an equivalent row set
        table.load_policies(&[leave]);
        assert_eq!(table.len(), 2);
        assert!(table.scope_exists("acme"));
    }

    #[test]
    fn scope_walk_is_most_specific_first() {
        let table = RuleTable::new();
        table.load_policies(&[
            resource_policy_set(
                "doc",
                "a.b",
                vec![simple_rule("r1", "view", "employee", Effect::Allow)],
                HashMap::new(),
            ),
            resource_policy_set(
                "doc",
                "",
                vec![simple_rule("r1", "view", "employee", Effect::Allow)],
                HashMap::new(),
            ),
        ]);

        let (scopes, first_key, first_fqn) = table.get_all_scopes("a.b.c", "doc", "default");
        assert_eq!(scopes, vec!["a.b".to_string(), "".to_string()]);
        assert_eq!(first_fqn, namer::resource_policy_fqn("doc", "default", "a.b"));
        assert_eq!(first_key, namer::policy_key_from_fqn(&first_fqn));
    }

    #[test]
    fn cyclic_role_graphs_resolve_finitely() {
        let table = RuleTable::new();
        table.load_policies(&[
            role_policy_set("r1", "", vec!["r2".into()]),
            role_policy_set("r2", "", vec!["r1".into()]),
        ]);

        let parents = table.get_parent_roles(&["r1".into()]);
        assert!(parents.contains(&"r1".to_string()));
        assert!(parents.contains(&"r2".to_string()));
        assert!(parents.len() <= 3);
    }

    #[test]
    fn role_policy_deletion_invalidates_ancestor_cache() {
        let table = RuleTable::new();
        let child = role_policy_set("child", "", vec!["parent".into()]);
        table.load_policies(&[child.clone(), role_policy_set("parent", "", vec![])]);

        // populate the memo
        let parents = table.get_parent_roles(&["child".into()]);
        assert!(parents.contains(&"parent".to_string()));

        table.delete_policy(&child);
        let parents = table.get_parent_roles(&["child".into()]);
        assert!(!parents.contains(&"parent".to_string()));
    }

    #[test]
    fn scan_matches_via_ancestor_roles_and_records_effective_role() {
        let table = RuleTable::new();
        table.load_policies(&[
            role_policy_set("junior", "", vec!["senior".into()]),
            resource_policy_set(
                "doc",
                "",
                vec![simple_rule("r1", "view", "senior", Effect::Allow)],
                HashMap::new(),
            ),
        ]);

        let rule_set = table.scan_rows("", "doc", &[], &["junior".into()], &["view".into()]);
        // the role policy row for junior matches directly; the resource row
        // for senior matches through the ancestor closure
        let via_ancestor: Vec<_> = rule_set
            .entries()
            .iter()
            .filter(|e| e.effective_role.is_some())
            .collect();
        assert_eq!(via_ancestor.len(), 1);
        assert_eq!(via_ancestor[0].role(), "junior");
        assert_eq!(via_ancestor[0].row.role, "senior");

        // a second filter pass matches on the effective role without
        // re-resolving ancestors
        let filtered = table.filter(&rule_set, &[], &["junior".into()], &["view".into()]);
        assert_eq!(filtered.len(), rule_set.len());
    }

    #[test]
    fn filter_narrows_by_scope_and_action() {
        let table = RuleTable::new();
        table.load_policies(&[
            resource_policy_set(
                "doc",
                "a",
                vec![
                    simple_rule("r1", "view", "employee", Effect::Allow),
                    simple_rule("r2", "edit", "employee", Effect::Deny),
                ],
                HashMap::new(),
            ),
            resource_policy_set(
                "doc",
                "",
                vec![simple_rule("r1", "view", "employee", Effect::Allow)],
                HashMap::new(),
            ),
        ]);

        let rule_set = table.scan_rows(
            "",
            "doc",
            &[],
            &["employee".into()],
            &["view".into(), "edit".into()],
        );
        assert_eq!(rule_set.len(), 3);

        let narrowed = table.filter(
            &rule_set,
            &["a".into()],
            &["employee".into()],
            &["edit".into()],
        );
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed.entries()[0].row.effect, Effect::Deny);
    }

    #[tokio::test]
    async fn storage_events_update_the_table() {
        use crate::loader::MemoryPolicyLoader;

        let loader = Arc::new(MemoryPolicyLoader::new());
        let policy = resource_policy_set(
            "doc",
            "",
            vec![simple_rule("r1", "view", "employee", Effect::Allow)],
            HashMap::new(),
        );
        let id = loader.put((*policy).clone()).await;

        let table = RuleTable::new().with_policy_loader(loader.clone());

        table
            .on_storage_event(&[StorageEvent::add_or_update(id.clone())])
            .await;
        assert_eq!(table.len(), 1);

        // removing from the store and signalling delete empties the table
        loader.remove(&id).await;
        table
            .on_storage_event(&[StorageEvent::delete_or_disable(id.clone())])
            .await;
        assert_eq!(table.len(), 0);

        // reload rebuilds from the loader snapshot
        loader.put((*policy).clone()).await;
        table.on_storage_event(&[StorageEvent::reload()]).await;
        assert_eq!(table.len(), 1);
    }
}
