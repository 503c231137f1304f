//! Rule table rows and per-query rule sets

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::policy::{Condition, Effect, OutputSpec, PolicyMeta, ScopePermissions, Variable};

/// The compiled constants and ordered variables a row's condition is
/// evaluated with, plus the key identifying that parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct RowParams {
    pub key: String,
    pub constants: HashMap<String, Value>,
    pub variables: Vec<Variable>,
}

/// One normalized (resource, role, action, scope) rule in the table.
///
/// Rows are immutable once constructed; a policy update replaces every row
/// that shares its origin FQN.
#[derive(Debug, Clone)]
pub struct RuleTableRow {
    /// FQN of the policy this row was expanded from.
    pub origin_fqn: String,
    pub resource: String,
    pub role: String,
    pub action: String,
    pub condition: Option<Arc<Condition>>,
    pub effect: Effect,
    pub scope: String,
    pub scope_permissions: ScopePermissions,
    pub version: String,
    /// Set when this row was expanded from a derived-role reference.
    pub origin_derived_role: Option<String>,
    pub output: Option<Arc<OutputSpec>>,
    /// Name of the source rule.
    pub name: String,
    pub meta: Arc<PolicyMeta>,
    pub params: Option<Arc<RowParams>>,
    /// Deterministic identifier tying the row to its parameter set.
    pub evaluation_key: String,
}

/// A row selected by a scan, together with the requested role it was matched
/// under when the match went through the role-ancestor closure.
///
/// The original index rewrote the shared row's role in place as a
/// memoization; returning the effective role alongside the untouched row
/// preserves the observable matches without mutating shared state.
#[derive(Debug, Clone)]
pub struct RuleSetEntry {
    pub row: Arc<RuleTableRow>,
    pub effective_role: Option<String>,
}

impl RuleSetEntry {
    /// The role this entry matches under: the rewrite target if the match
    /// came through an ancestor role, the row's own role otherwise.
    pub fn role(&self) -> &str {
        self.effective_role.as_deref().unwrap_or(&self.row.role)
    }
}

/// Scope-indexed result of scanning the rule table for one request.
#[derive(Debug, Default)]
pub struct RuleSet {
    entries: Vec<RuleSetEntry>,
    scope_index: HashMap<String, Vec<usize>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_matching_row(&mut self, row: Arc<RuleTableRow>, effective_role: Option<String>) {
        let idx = self.entries.len();
        self.scope_index
            .entry(row.scope.clone())
            .or_default()
            .push(idx);
        self.entries.push(RuleSetEntry {
            row,
            effective_role,
        });
    }

    /// Matching entries in scan order.
    pub fn entries(&self) -> &[RuleSetEntry] {
        &self.entries
    }

    /// Entries belonging to `scope`, in scan order.
    pub fn entries_for_scope(&self, scope: &str) -> impl Iterator<Item = &RuleSetEntry> {
        self.scope_index
            .get(scope)
            .into_iter()
            .flatten()
            .map(|idx| &self.entries[*idx])
    }

    /// Scopes present in this rule set.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope_index.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
