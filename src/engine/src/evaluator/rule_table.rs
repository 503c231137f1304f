//! Evaluator over a scanned rule-table view

use std::sync::Arc;

use super::{
    resolve_scoped_outcomes, EffectInfo, EvalParams, PolicyEvalResult, ScopeOutcome,
};
use crate::conditions::{ConditionEvaluator, EvalContext, ParamSet};
use crate::error::Result;
use crate::matcher::matches_glob;
use crate::namer;
use crate::policy::{Effect, ScopePermissions};
use crate::request::{CheckInput, OutputEntry};
use crate::ruletable::{RuleSetEntry, RuleTable};
use crate::schema::SchemaValidator;
use crate::tracer::TraceContext;

/// Evaluates a request against the rule table: resolves the applicable scope
/// chain, scans the matching rows once, then folds per-scope outcomes into a
/// final effect per action.
pub struct RuleTableEvaluator {
    table: Arc<RuleTable>,
    schema_validator: Arc<dyn SchemaValidator>,
    conditions: Arc<dyn ConditionEvaluator>,
    params: EvalParams,
}

impl RuleTableEvaluator {
    pub fn new(
        table: Arc<RuleTable>,
        schema_validator: Arc<dyn SchemaValidator>,
        conditions: Arc<dyn ConditionEvaluator>,
        params: EvalParams,
    ) -> Self {
        Self {
            table,
            schema_validator,
            conditions,
            params,
        }
    }

    pub fn evaluate(&self, input: &CheckInput, tctx: &TraceContext) -> Result<PolicyEvalResult> {
        let mut result = PolicyEvalResult::default();

        let version = if input.resource.policy_version.is_empty() {
            self.params.default_policy_version.as_str()
        } else {
            input.resource.policy_version.as_str()
        };
        let resource = namer::sanitized_resource(&input.resource.kind);

        let (scopes, _, first_fqn) =
            self.table
                .get_all_scopes(&input.resource.scope, &resource, version);

        if scopes.is_empty() {
            result.to_resolve.extend(input.actions.iter().cloned());
            return Ok(result);
        }

        result.validation_errors =
            self.schema_validator
                .validate(self.table.get_schema(&first_fqn).as_ref(), input)?;

        let rule_set = self.table.scan_rows(
            version,
            &resource,
            &scopes,
            &input.principal.roles,
            &input.actions,
        );

        let eval_ctx = EvalContext::for_check_input(input, &self.params.globals);

        for action in &input.actions {
            let mut outcomes = Vec::with_capacity(scopes.len());
            for scope in &scopes {
                let mode = match self.table.get_scope_scope_permissions(scope) {
                    ScopePermissions::RequireParentalConsentForAllows => {
                        ScopePermissions::RequireParentalConsentForAllows
                    }
                    _ => ScopePermissions::OverrideParent,
                };

                let candidates = rule_set
                    .entries_for_scope(scope)
                    .filter(|entry| matches_glob(&entry.row.action, action));
                let outcome =
                    self.evaluate_scope(candidates, action, &eval_ctx, tctx, &mut result)?;
                outcomes.push((mode, outcome));
            }

            match resolve_scoped_outcomes(outcomes) {
                Some(info) => {
                    tctx.start_action(action).applied_effect(
                        info.effect,
                        &info.policy,
                        "Rule table decision",
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

    /// Evaluates the candidate rows of one scope in scan order; the first
    /// row whose condition passes decides the scope outcome.
    fn evaluate_scope<'a>(
        &self,
        candidates: impl Iterator<Item = &'a RuleSetEntry>,
        action: &str,
        eval_ctx: &EvalContext,
        tctx: &TraceContext,
        result: &mut PolicyEvalResult,
    ) -> Result<ScopeOutcome> {
        for entry in candidates {
            let row = &entry.row;

            // every evaluated rule lands on the audit trail, matched or not
            result
                .audit_trail
                .add_policy(row.meta.fqn.clone(), row.meta.source_attributes.clone());

            let params = match &row.params {
                Some(p) => ParamSet::new(&p.constants, &p.variables),
                None => ParamSet::empty(),
            };

            let matched = match &row.condition {
                Some(condition) => {
                    self.conditions
                        .check(condition, eval_ctx, &params, self.params.now)?
                }
                None => true,
            };

            let policy_key = namer::policy_key_from_fqn(&row.meta.fqn);

            if !matched {
                tctx.start_action(action).condition_not_satisfied(&policy_key);
                if let Some(output) = &row.output {
                    if let Some(expr) = &output.when_condition_not_met {
                        let val = self.conditions.evaluate_output(
                            expr,
                            eval_ctx,
                            &params,
                            self.params.now,
                        )?;
                        result.outputs.push(OutputEntry {
                            src: row.evaluation_key.clone(),
                            val,
                        });
                    }
                }
                continue;
            }

            if let Some(derived_role) = &row.origin_derived_role {
                result.effective_derived_roles.insert(derived_role.clone());
            }

            if let Some(output) = &row.output {
                if let Some(expr) = &output.when_rule_activated {
                    let val = self.conditions.evaluate_output(
                        expr,
                        eval_ctx,
                        &params,
                        self.params.now,
                    )?;
                    result.outputs.push(OutputEntry {
                        src: row.evaluation_key.clone(),
                        val,
                    });
                }
            }

            if row.effect == Effect::NoMatch {
                continue;
            }

            return Ok(ScopeOutcome::Decided(EffectInfo {
                effect: row.effect,
                policy: policy_key,
                scope: row.scope.clone(),
            }));
        }

        Ok(ScopeOutcome::NoMatch)
    }
}
