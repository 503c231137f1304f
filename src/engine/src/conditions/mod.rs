//! Condition evaluation capability
//!
//! The engine treats condition evaluation as a black box: it hands a
//! [`Condition`] tree, the request context and the rule's parameter set to a
//! [`ConditionEvaluator`] and gets back a match/no-match verdict. The default
//! implementation is CEL-backed (see [`cel`]); embedders can substitute their
//! own.

pub mod cel;

pub use cel::CelConditionEvaluator;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::policy::{Condition, Variable};
use crate::request::CheckInput;

/// Condition evaluation errors
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Condition compilation failed: {0}")]
    Compilation(String),

    #[error("Condition evaluation failed: {0}")]
    Evaluation(String),

    #[error("Condition did not return a boolean result")]
    NonBooleanResult,
}

/// Variables available to a condition: principal, resource and the request
/// envelope, plus engine-wide globals.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub principal: HashMap<String, Value>,
    pub resource: HashMap<String, Value>,
    pub request: HashMap<String, Value>,
    pub globals: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the context for a check request.
    pub fn for_check_input(input: &CheckInput, globals: &HashMap<String, Value>) -> Self {
        let principal = principal_vars(
            &input.principal.id,
            &input.principal.roles,
            &input.principal.scope,
            &input.principal.attr,
        );
        let resource = resource_vars(
            &input.resource.kind,
            &input.resource.id,
            &input.resource.scope,
            &input.resource.attr,
        );

        let mut request = HashMap::new();
        request.insert("principal".to_string(), json!(principal));
        request.insert("resource".to_string(), json!(resource));

        Self {
            principal,
            resource,
            request,
            globals: globals.clone(),
        }
    }

    /// Builds the context for a plan request (no concrete resource instance).
    pub fn for_plan_input(
        principal_id: &str,
        roles: &[String],
        principal_scope: &str,
        principal_attr: &HashMap<String, Value>,
        resource_kind: &str,
        resource_scope: &str,
        resource_attr: &HashMap<String, Value>,
        globals: &HashMap<String, Value>,
    ) -> Self {
        let principal = principal_vars(principal_id, roles, principal_scope, principal_attr);
        let resource = resource_vars(resource_kind, "", resource_scope, resource_attr);

        let mut request = HashMap::new();
        request.insert("principal".to_string(), json!(principal));
        request.insert("resource".to_string(), json!(resource));

        Self {
            principal,
            resource,
            request,
            globals: globals.clone(),
        }
    }
}

fn principal_vars(
    id: &str,
    roles: &[String],
    scope: &str,
    attr: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut vars = HashMap::new();
    vars.insert("id".to_string(), json!(id));
    vars.insert("roles".to_string(), json!(roles));
    vars.insert("scope".to_string(), json!(scope));
    vars.insert("attr".to_string(), json!(attr));
    vars
}

fn resource_vars(
    kind: &str,
    id: &str,
    scope: &str,
    attr: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut vars = HashMap::new();
    vars.insert("kind".to_string(), json!(kind));
    vars.insert("id".to_string(), json!(id));
    vars.insert("scope".to_string(), json!(scope));
    vars.insert("attr".to_string(), json!(attr));
    vars
}

/// Constants and ordered variables compiled alongside a rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamSet<'a> {
    pub constants: Option<&'a HashMap<String, Value>>,
    pub variables: &'a [Variable],
}

impl<'a> ParamSet<'a> {
    pub fn new(constants: &'a HashMap<String, Value>, variables: &'a [Variable]) -> Self {
        Self {
            constants: Some(constants),
            variables,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Black-box condition evaluation capability.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates a condition tree against the request context.
    fn check(
        &self,
        condition: &Condition,
        ctx: &EvalContext,
        params: &ParamSet<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, ConditionError>;

    /// Evaluates an output expression to a value.
    fn evaluate_output(
        &self,
        expr: &str,
        ctx: &EvalContext,
        params: &ParamSet<'_>,
        now: DateTime<Utc>,
    ) -> Result<Value, ConditionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Principal, Resource};

    #[test]
    fn check_input_context_exposes_request_envelope() {
        let input = CheckInput {
            request_id: "req-1".into(),
            principal: Principal::new("alice", vec!["employee".into()])
                .with_attr("department", json!("hr")),
            resource: Resource::new("leave_request", "XX125"),
            actions: vec!["view".into()],
        };

        let ctx = EvalContext::for_check_input(&input, &HashMap::new());
        assert_eq!(ctx.principal.get("id"), Some(&json!("alice")));
        assert_eq!(ctx.resource.get("kind"), Some(&json!("leave_request")));

        let request_principal = ctx.request.get("principal").unwrap();
        assert_eq!(request_principal.get("id"), Some(&json!("alice")));
    }
}
