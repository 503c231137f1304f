//! Policy evaluators and the evaluation context
//!
//! Two evaluator variants exist: one over a compiled principal policy and one
//! over a scanned rule-table view. The evaluation context chains them
//! (principal first), merging partial results with "first resolver wins"
//! semantics and defaulting anything left unresolved to DENY.

mod principal;
mod rule_table;

pub use principal::PrincipalPolicyEvaluator;
pub use rule_table::RuleTableEvaluator;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::error;

use crate::audit::AuditTrail;
use crate::error::{EngineError, Result};
use crate::policy::{Effect, ScopePermissions};
use crate::request::{CheckInput, OutputEntry};
use crate::schema::ValidationError;
use crate::tracer::TraceContext;

/// Policy tag applied to actions no policy resolved.
pub const NO_POLICY_MATCH: &str = "NO_MATCH";

/// Effect applied to actions no policy resolved.
pub const DEFAULT_EFFECT: Effect = Effect::Deny;

/// Evaluation parameters resolved from engine configuration and per-call
/// options.
#[derive(Debug, Clone)]
pub struct EvalParams {
    pub globals: HashMap<String, Value>,
    pub now: DateTime<Utc>,
    pub default_policy_version: String,
    pub lenient_scope_search: bool,
}

/// The decision one layer produced for one action.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectInfo {
    pub effect: Effect,
    /// Key of the deciding policy.
    pub policy: String,
    /// Scope of the deciding rule.
    pub scope: String,
}

/// Partial result produced by a single evaluator.
#[derive(Debug, Default)]
pub struct PolicyEvalResult {
    pub effects: HashMap<String, EffectInfo>,
    pub audit_trail: AuditTrail,
    pub effective_derived_roles: HashSet<String>,
    pub validation_errors: Vec<ValidationError>,
    pub outputs: Vec<OutputEntry>,
    /// Actions this layer could not conclusively resolve.
    pub to_resolve: HashSet<String>,
}

/// Polymorphic evaluator over the two policy layers.
pub enum Evaluator {
    PrincipalPolicy(PrincipalPolicyEvaluator),
    RuleTable(RuleTableEvaluator),
}

impl Evaluator {
    pub fn evaluate(&self, input: &CheckInput, tctx: &TraceContext) -> Result<PolicyEvalResult> {
        match self {
            Evaluator::PrincipalPolicy(eval) => eval.evaluate(input, tctx),
            Evaluator::RuleTable(eval) => eval.evaluate(input, tctx),
        }
    }
}

/// What one scope level concluded for an action.
#[derive(Debug, Clone)]
pub(crate) enum ScopeOutcome {
    Decided(EffectInfo),
    NoMatch,
}

/// Folds per-scope outcomes (most specific first) into a final effect.
///
/// A DENY is final wherever it appears. An ALLOW is final when its scope
/// overrides the parent; under `RequireParentalConsentForAllows` it is
/// provisional and every ancestor scope must also allow the action. A scope
/// with no matching rule voids a provisional allow.
pub(crate) fn resolve_scoped_outcomes<I>(outcomes: I) -> Option<EffectInfo>
where
    I: IntoIterator<Item = (ScopePermissions, ScopeOutcome)>,
{
    let mut pending_allow: Option<EffectInfo> = None;

    for (mode, outcome) in outcomes {
        match outcome {
            ScopeOutcome::Decided(info) if info.effect == Effect::Deny => {
                return Some(info);
            }
            ScopeOutcome::Decided(info) => {
                // keep the most specific allow's identity
                let info = pending_allow.take().unwrap_or(info);
                match mode {
                    ScopePermissions::RequireParentalConsentForAllows => {
                        pending_allow = Some(info);
                    }
                    _ => return Some(info),
                }
            }
            ScopeOutcome::NoMatch => {
                if pending_allow.is_some() {
                    // a silent ancestor withholds consent
                    return None;
                }
            }
        }
    }

    // every ancestor up to the root consented
    pending_allow
}

/// Merged result of an evaluation chain.
#[derive(Debug, Default)]
pub struct EvaluationResult {
    pub effects: HashMap<String, EffectInfo>,
    pub audit_trail: AuditTrail,
    pub effective_derived_roles: HashSet<String>,
    pub validation_errors: Vec<ValidationError>,
    pub outputs: Vec<OutputEntry>,
    pub to_resolve: HashSet<String>,
}

impl EvaluationResult {
    /// Merges a layer's partial result, only updating actions that are not
    /// yet concretely resolved. Returns true while actions remain
    /// unresolved.
    fn merge(&mut self, result: PolicyEvalResult) -> bool {
        self.audit_trail.merge(result.audit_trail);
        self.effective_derived_roles
            .extend(result.effective_derived_roles);
        self.validation_errors.extend(result.validation_errors);
        self.outputs.extend(result.outputs);

        for (action, effect) in result.effects {
            match self.effects.get(&action) {
                Some(current) if current.effect != Effect::NoMatch => {}
                _ => {
                    self.effects.insert(action.clone(), effect);
                    self.to_resolve.remove(&action);
                }
            }
        }

        for action in result.to_resolve {
            if !matches!(self.effects.get(&action), Some(info) if info.effect != Effect::NoMatch) {
                self.to_resolve.insert(action);
            }
        }

        !self.to_resolve.is_empty()
    }

    fn set_defaults_for_unmatched_actions(&mut self, tctx: &TraceContext, input: &CheckInput) {
        for action in &input.actions {
            if let Some(current) = self.effects.get(action) {
                if current.effect != Effect::NoMatch {
                    continue;
                }
            }

            tctx.start_action(action).applied_effect(
                DEFAULT_EFFECT,
                NO_POLICY_MATCH,
                "No matching policies",
            );
            self.effects.insert(
                action.clone(),
                EffectInfo {
                    effect: DEFAULT_EFFECT,
                    policy: NO_POLICY_MATCH.to_string(),
                    scope: String::new(),
                },
            );
        }
        self.to_resolve.clear();
    }
}

/// Ordered, short-circuiting chain of evaluators: principal policy first,
/// then the rule table.
#[derive(Default)]
pub struct EvaluationCtx {
    checks: Vec<Evaluator>,
}

impl EvaluationCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_check(&mut self, evaluator: Option<Evaluator>) {
        if let Some(evaluator) = evaluator {
            self.checks.push(evaluator);
        }
    }

    pub fn num_checks(&self) -> usize {
        self.checks.len()
    }

    pub fn evaluate(&self, input: &CheckInput, tctx: &TraceContext) -> Result<EvaluationResult> {
        let mut result = EvaluationResult::default();

        if self.checks.is_empty() {
            result.set_defaults_for_unmatched_actions(tctx, input);
            return Ok(result);
        }

        for check in &self.checks {
            let partial = check.evaluate(input, tctx).map_err(|err| {
                error!(error = %err, "Failed to evaluate policy");
                EngineError::Evaluation(err.to_string())
            })?;

            let incomplete = result.merge(partial);
            if !incomplete {
                return Ok(result);
            }
        }

        result.set_defaults_for_unmatched_actions(tctx, input);

        Ok(result)
    }
}
