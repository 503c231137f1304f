//! Symbolic query planning surface
//!
//! `plan_resources` answers "which instances of this resource kind could the
//! principal act on" with a symbolic filter instead of a concrete decision.
//! The plan-reduction algebra is owned by an external planner subsystem;
//! this module defines the plan surface the engine consumes — branch
//! emptiness checks, normalization to unconditional deny, and combination of
//! the principal and resource layers — plus a structural (non-reducing)
//! default combiner.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::evaluator::EvalParams;
use crate::namer;
use crate::policy::{Condition, Effect, PrincipalPolicySet};
use crate::request::Principal;
use crate::ruletable::RuleTable;

/// A plan request: a principal, a resource kind (no concrete instance) and
/// the actions being planned for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourcesInput {
    #[serde(default)]
    pub request_id: String,
    pub principal: Principal,
    pub resource: PlanResource,
    pub actions: Vec<String>,
}

/// The resource side of a plan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResource {
    pub kind: String,
    #[serde(default)]
    pub policy_version: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub attr: HashMap<String, serde_json::Value>,
}

/// Symbolic filter expression over rule conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanExpr {
    Condition(Box<Condition>),
    And(Vec<PlanExpr>),
    Or(Vec<PlanExpr>),
    Not(Box<PlanExpr>),
}

/// One branch entry of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanNode {
    Unconditional,
    Conditional(PlanExpr),
}

/// A symbolic plan: the conditions under which actions are allowed and
/// denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPlanResult {
    pub allow: Vec<PlanNode>,
    pub deny: Vec<PlanNode>,
    unconditional_deny: bool,
}

impl PolicyPlanResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allow(&mut self, node: PlanNode) {
        self.allow.push(node);
    }

    pub fn add_deny(&mut self, node: PlanNode) {
        self.deny.push(node);
    }

    pub fn allow_is_empty(&self) -> bool {
        self.allow.is_empty()
    }

    pub fn deny_is_empty(&self) -> bool {
        self.deny.is_empty() && !self.unconditional_deny
    }

    pub fn is_empty(&self) -> bool {
        self.allow_is_empty() && self.deny_is_empty()
    }

    /// Collapses the plan to an unconditional DENY. Applied when the ALLOW
    /// branch is empty but the DENY branch is not: a plan that can never
    /// allow is meaningless as a conditional filter.
    pub fn reset_to_unconditional_deny(&mut self) {
        self.allow.clear();
        self.deny.clear();
        self.unconditional_deny = true;
    }

    pub fn is_unconditional_deny(&self) -> bool {
        self.unconditional_deny
    }

    /// Renders the plan into the response filter.
    pub fn to_output(&self, input: &PlanResourcesInput) -> PlanResourcesOutput {
        let filter = if self.unconditional_deny {
            PlanFilter::AlwaysDenied
        } else if self.is_empty() {
            PlanFilter::AlwaysDenied
        } else if self.deny.is_empty()
            && self.allow.iter().any(|n| matches!(n, PlanNode::Unconditional))
        {
            PlanFilter::AlwaysAllowed
        } else {
            PlanFilter::Conditional(self.to_filter_expr())
        };

        PlanResourcesOutput {
            request_id: input.request_id.clone(),
            actions: input.actions.clone(),
            resource_kind: input.resource.kind.clone(),
            policy_version: input.resource.policy_version.clone(),
            scope: input.resource.scope.clone(),
            filter,
            filter_debug: None,
        }
    }

    fn to_filter_expr(&self) -> PlanExpr {
        let unconditionally_allowed = self
            .allow
            .iter()
            .any(|n| matches!(n, PlanNode::Unconditional));

        let allow_conditions: Vec<PlanExpr> = self
            .allow
            .iter()
            .filter_map(|n| match n {
                PlanNode::Conditional(expr) => Some(expr.clone()),
                PlanNode::Unconditional => None,
            })
            .collect();

        let deny_conditions: Vec<PlanExpr> = self
            .deny
            .iter()
            .filter_map(|n| match n {
                PlanNode::Conditional(expr) => Some(expr.clone()),
                PlanNode::Unconditional => None,
            })
            .collect();

        let allow_expr = if unconditionally_allowed {
            None
        } else {
            or_of(allow_conditions)
        };

        let deny_expr = or_of(deny_conditions).map(|expr| PlanExpr::Not(Box::new(expr)));

        match (allow_expr, deny_expr) {
            (Some(a), Some(d)) => PlanExpr::And(vec![a, d]),
            (Some(a), None) => a,
            (None, Some(d)) => d,
            // unreachable via to_output: an empty plan renders AlwaysDenied
            (None, None) => PlanExpr::Or(Vec::new()),
        }
    }
}

/// Disjunction of `exprs`, flattened for the trivial cases.
fn or_of(mut exprs: Vec<PlanExpr>) -> Option<PlanExpr> {
    match exprs.len() {
        0 => None,
        1 => exprs.pop(),
        _ => Some(PlanExpr::Or(exprs)),
    }
}

/// The filter a plan renders to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanFilter {
    AlwaysAllowed,
    AlwaysDenied,
    Conditional(PlanExpr),
}

/// Result of a plan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourcesOutput {
    #[serde(default)]
    pub request_id: String,
    pub actions: Vec<String>,
    pub resource_kind: String,
    #[serde(default)]
    pub policy_version: String,
    #[serde(default)]
    pub scope: String,
    pub filter: PlanFilter,
    /// Diagnostic tag; set to `NO_MATCH` when no policy contributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_debug: Option<String>,
}

/// Query planner capability consumed by the engine.
pub trait QueryPlanner: Send + Sync {
    /// Plans the principal-policy layer.
    fn plan_principal_policy(
        &self,
        policy: &PrincipalPolicySet,
        input: &PlanResourcesInput,
        params: &EvalParams,
    ) -> Result<PolicyPlanResult>;

    /// Plans the resource/rule-table layer.
    fn plan_rule_table(
        &self,
        table: &RuleTable,
        input: &PlanResourcesInput,
        params: &EvalParams,
    ) -> Result<PolicyPlanResult>;

    /// Combines the principal plan with the resource plan
    /// (`principal ∧ resource`).
    fn combine(&self, a: PolicyPlanResult, b: PolicyPlanResult) -> PolicyPlanResult;
}

/// Default planner: emits one branch entry per matching rule and combines
/// layers structurally, without reducing the resulting expression.
#[derive(Debug, Default)]
pub struct StructuralPlanner;

impl StructuralPlanner {
    fn node_for(condition: Option<&Condition>) -> PlanNode {
        match condition {
            Some(c) => PlanNode::Conditional(PlanExpr::Condition(Box::new(c.clone()))),
            None => PlanNode::Unconditional,
        }
    }
}

impl QueryPlanner for StructuralPlanner {
    fn plan_principal_policy(
        &self,
        policy: &PrincipalPolicySet,
        input: &PlanResourcesInput,
        _params: &EvalParams,
    ) -> Result<PolicyPlanResult> {
        let mut plan = PolicyPlanResult::new();

        for scoped in &policy.policies {
            for resource_rule in &scoped.resource_rules {
                if !crate::matcher::matches_glob(&resource_rule.resource, &input.resource.kind) {
                    continue;
                }

                for rule in &resource_rule.rules {
                    if !crate::matcher::matches_any(&rule.action, &input.actions) {
                        continue;
                    }

                    match rule.effect {
                        Effect::Allow => plan.add_allow(Self::node_for(rule.condition.as_ref())),
                        Effect::Deny => plan.add_deny(Self::node_for(rule.condition.as_ref())),
                        Effect::NoMatch => {}
                    }
                }
            }
        }

        Ok(plan)
    }

    fn plan_rule_table(
        &self,
        table: &RuleTable,
        input: &PlanResourcesInput,
        params: &EvalParams,
    ) -> Result<PolicyPlanResult> {
        let version = if input.resource.policy_version.is_empty() {
            params.default_policy_version.as_str()
        } else {
            input.resource.policy_version.as_str()
        };
        let resource = namer::sanitized_resource(&input.resource.kind);

        let (scopes, _, _) = table.get_all_scopes(&input.resource.scope, &resource, version);

        let mut plan = PolicyPlanResult::new();
        if scopes.is_empty() {
            return Ok(plan);
        }

        let rule_set = table.scan_rows(
            version,
            &resource,
            &scopes,
            &input.principal.roles,
            &input.actions,
        );

        for entry in rule_set.entries() {
            let row = &entry.row;
            match row.effect {
                Effect::Allow => plan.add_allow(Self::node_for(row.condition.as_deref())),
                Effect::Deny => plan.add_deny(Self::node_for(row.condition.as_deref())),
                Effect::NoMatch => {}
            }
        }

        Ok(plan)
    }

    fn combine(&self, a: PolicyPlanResult, b: PolicyPlanResult) -> PolicyPlanResult {
        if a.is_empty() && !a.is_unconditional_deny() {
            return b;
        }
        if b.is_empty() && !b.is_unconditional_deny() {
            return a;
        }

        let mut combined = PolicyPlanResult::new();
        if a.is_unconditional_deny() || b.is_unconditional_deny() {
            combined.reset_to_unconditional_deny();
            return combined;
        }

        // allow branches conjoin across layers; deny branches accumulate
        let allow_side = |plan: &PolicyPlanResult| -> Option<PlanNode> {
            if plan.allow.is_empty() {
                return None;
            }
            if plan
                .allow
                .iter()
                .any(|n| matches!(n, PlanNode::Unconditional))
            {
                return Some(PlanNode::Unconditional);
            }
            let exprs: Vec<PlanExpr> = plan
                .allow
                .iter()
                .filter_map(|n| match n {
                    PlanNode::Conditional(e) => Some(e.clone()),
                    PlanNode::Unconditional => None,
                })
                .collect();
            or_of(exprs).map(PlanNode::Conditional)
        };

        match (allow_side(&a), allow_side(&b)) {
            (Some(PlanNode::Unconditional), Some(other))
            | (Some(other), Some(PlanNode::Unconditional)) => combined.add_allow(other),
            (Some(PlanNode::Conditional(ea)), Some(PlanNode::Conditional(eb))) => {
                combined.add_allow(PlanNode::Conditional(PlanExpr::And(vec![ea, eb])));
            }
            (Some(node), None) | (None, Some(node)) => combined.add_allow(node),
            (None, None) => {}
        }

        combined.deny.extend(a.deny);
        combined.deny.extend(b.deny);

        combined
    }
}
