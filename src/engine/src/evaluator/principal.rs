//! Evaluator over a compiled principal policy

use std::sync::Arc;

use super::{
    resolve_scoped_outcomes, EffectInfo, EvalParams, PolicyEvalResult, ScopeOutcome,
};
use crate::conditions::{ConditionEvaluator, EvalContext, ParamSet};
use crate::error::Result;
use crate::matcher::matches_glob;
use crate::namer;
use crate::policy::{Effect, PrincipalPolicy, PrincipalPolicySet, ScopePermissions};
use crate::request::{CheckInput, OutputEntry};
use crate::tracer::TraceContext;

/// Evaluates a request against a single compiled principal policy set.
///
/// The set carries one policy per scope, ordered most specific first; the
/// scope-permission semantics mirror the rule-table evaluator's.
pub struct PrincipalPolicyEvaluator {
    policy: Arc<PrincipalPolicySet>,
    conditions: Arc<dyn ConditionEvaluator>,
    params: EvalParams,
}

impl PrincipalPolicyEvaluator {
    pub fn new(
        policy: Arc<PrincipalPolicySet>,
        conditions: Arc<dyn ConditionEvaluator>,
        params: EvalParams,
    ) -> Self {
        Self {
            policy,
            conditions,
            params,
        }
    }

    pub fn evaluate(&self, input: &CheckInput, tctx: &TraceContext) -> Result<PolicyEvalResult> {
        let mut result = PolicyEvalResult::default();
        result.audit_trail.add_policy(
            self.policy.meta.fqn.clone(),
            self.policy.meta.source_attributes.clone(),
        );

        let eval_ctx = EvalContext::for_check_input(input, &self.params.globals);

        for action in &input.actions {
            let mut outcomes = Vec::with_capacity(self.policy.policies.len());
            for scoped in &self.policy.policies {
                let outcome =
                    self.evaluate_scope(scoped, action, input, &eval_ctx, tctx, &mut result)?;
                let mode = match scoped.scope_permissions {
                    ScopePermissions::Unspecified => ScopePermissions::OverrideParent,
                    other => other,
                };
                outcomes.push((mode, outcome));
            }

            match resolve_scoped_outcomes(outcomes) {
                Some(info) => {
                    tctx.start_action(action).applied_effect(
                        info.effect,
                        &info.policy,
                        "Principal policy decision",
                    );
                    result.effects.insert(action.clone(), info);
                }
                None => {
                    result.to_resolve.insert(action.clone());
                }
            }
        }

        Ok(result)
    }

    /// Evaluates one scope level; the first rule whose condition passes
    /// decides the scope outcome.
    fn evaluate_scope(
        &self,
        scoped: &PrincipalPolicy,
        action: &str,
        input: &CheckInput,
        eval_ctx: &EvalContext,
        tctx: &TraceContext,
        result: &mut PolicyEvalResult,
    ) -> Result<ScopeOutcome> {
        let policy_key = namer::policy_key_from_fqn(&namer::principal_policy_fqn(
            &self.policy.principal,
            &self.policy.version,
            &scoped.scope,
        ));
        let params = ParamSet::new(&scoped.constants, &scoped.variables);

        for resource_rule in &scoped.resource_rules {
            if !matches_glob(&resource_rule.resource, &input.resource.kind) {
                continue;
            }

            for rule in &resource_rule.rules {
                if !matches_glob(&rule.action, action) {
                    continue;
                }

                let evaluation_key = format!("{policy_key}#{}", rule.name);
                let matched = match &rule.condition {
                    Some(condition) => {
                        self.conditions
                            .check(condition, eval_ctx, &params, self.params.now)?
                    }
                    None => true,
                };

                if !matched {
                    tctx.start_action(action).condition_not_satisfied(&policy_key);
                    if let Some(output) = &rule.output {
                        if let Some(expr) = &output.when_condition_not_met {
                            let val = self.conditions.evaluate_output(
                                expr,
                                eval_ctx,
                                &params,
                                self.params.now,
                            )?;
                            result.outputs.push(OutputEntry {
                                src: evaluation_key.clone(),
                                val,
                            });
                        }
                    }
                    continue;
                }

                if let Some(output) = &rule.output {
                    if let Some(expr) = &output.when_rule_activated {
                        let val = self.conditions.evaluate_output(
                            expr,
                            eval_ctx,
                            &params,
                            self.params.now,
                        )?;
                        result.outputs.push(OutputEntry {
                            src: evaluation_key.clone(),
                            val,
                        });
                    }
                }

                if rule.effect == Effect::NoMatch {
                    continue;
                }

                return Ok(ScopeOutcome::Decided(EffectInfo {
                    effect: rule.effect,
                    policy: policy_key,
                    scope: scoped.scope.clone(),
                }));
            }
        }

        Ok(ScopeOutcome::NoMatch)
    }
}
