//! CEL-backed condition evaluator with compiled program caching

use cel_interpreter::objects::Value as CelValue;
use cel_interpreter::{Context, Program};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

use super::{ConditionError, ConditionEvaluator, EvalContext, ParamSet};
use crate::policy::Condition;

/// Evaluates condition trees whose leaf expressions are CEL.
///
/// Compiled programs are cached keyed by source expression, so repeat
/// evaluations of the same rule skip parsing entirely.
pub struct CelConditionEvaluator {
    program_cache: DashMap<String, Arc<Program>>,
}

impl CelConditionEvaluator {
    pub fn new() -> Self {
        Self {
            program_cache: DashMap::new(),
        }
    }

    /// Compile a CEL expression, reusing the cached program if available.
    fn compile(&self, expr: &str) -> Result<Arc<Program>, ConditionError> {
        if let Some(prog) = self.program_cache.get(expr) {
            return Ok(prog.clone());
        }

        let program = Program::compile(expr)
            .map_err(|e| ConditionError::Compilation(format!("{e:?}")))?;

        let program = Arc::new(program);
        self.program_cache
            .insert(expr.to_string(), program.clone());

        Ok(program)
    }

    /// Number of cached programs.
    pub fn cached_programs(&self) -> usize {
        self.program_cache.len()
    }

    pub fn clear_cache(&self) {
        self.program_cache.clear();
    }

    /// Builds the CEL context: request variables with `P`/`R`/`G` aliases,
    /// constants under `C`, evaluated variables under `V`, and `now`.
    fn build_context(
        &self,
        ctx: &EvalContext,
        params: &ParamSet<'_>,
        now: DateTime<Utc>,
    ) -> Result<Context, ConditionError> {
        let mut cel_ctx = Context::default();

        let add = |cel_ctx: &mut Context, name: &str, value: &JsonValue| {
            let _ = cel_ctx.add_variable(name.to_string(), json_to_cel(value));
        };

        let principal = json!(ctx.principal);
        let resource = json!(ctx.resource);
        let request = json!(ctx.request);
        let globals = json!(ctx.globals);

        add(&mut cel_ctx, "principal", &principal);
        add(&mut cel_ctx, "P", &principal);
        add(&mut cel_ctx, "resource", &resource);
        add(&mut cel_ctx, "R", &resource);
        add(&mut cel_ctx, "request", &request);
        add(&mut cel_ctx, "globals", &globals);
        add(&mut cel_ctx, "G", &globals);
        add(&mut cel_ctx, "now", &json!(now.to_rfc3339()));

        if let Some(constants) = params.constants {
            let constants = json!(constants);
            add(&mut cel_ctx, "constants", &constants);
            add(&mut cel_ctx, "C", &constants);
        }

        // Variables are evaluated in compilation order; later variables can
        // reference earlier ones through V.
        let mut evaluated: HashMap<String, JsonValue> = HashMap::new();
        for variable in params.variables {
            let vars = json!(evaluated);
            add(&mut cel_ctx, "variables", &vars);
            add(&mut cel_ctx, "V", &vars);

            let program = self.compile(&variable.expr)?;
            let result = program
                .execute(&cel_ctx)
                .map_err(|e| ConditionError::Evaluation(format!("{e:?}")))?;
            evaluated.insert(variable.name.clone(), cel_to_json(&result));
        }

        let vars = json!(evaluated);
        add(&mut cel_ctx, "variables", &vars);
        add(&mut cel_ctx, "V", &vars);

        Ok(cel_ctx)
    }

    fn check_leaf(&self, expr: &str, cel_ctx: &Context) -> Result<bool, ConditionError> {
        let program = self.compile(expr)?;
        let result = program
            .execute(cel_ctx)
            .map_err(|e| ConditionError::Evaluation(format!("{e:?}")))?;

        match result {
            CelValue::Bool(b) => Ok(b),
            _ => Err(ConditionError::NonBooleanResult),
        }
    }

    fn check_tree(&self, condition: &Condition, cel_ctx: &Context) -> Result<bool, ConditionError> {
        match condition {
            Condition::Expr(expr) => self.check_leaf(expr, cel_ctx),
            Condition::All(children) => {
                for child in children {
                    if !self.check_tree(child, cel_ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(children) => {
                for child in children {
                    if self.check_tree(child, cel_ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::None(children) => {
                for child in children {
                    if self.check_tree(child, cel_ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

impl Default for CelConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// Thread safety: the program cache is a DashMap and compiled programs are
// never mutated after insertion.
unsafe impl Send for CelConditionEvaluator {}
unsafe impl Sync for CelConditionEvaluator {}

impl ConditionEvaluator for CelConditionEvaluator {
    fn check(
        &self,
        condition: &Condition,
        ctx: &EvalContext,
        params: &ParamSet<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, ConditionError> {
        let cel_ctx = self.build_context(ctx, params, now)?;
        self.check_tree(condition, &cel_ctx)
    }

    fn evaluate_output(
        &self,
        expr: &str,
        ctx: &EvalContext,
        params: &ParamSet<'_>,
        now: DateTime<Utc>,
    ) -> Result<JsonValue, ConditionError> {
        let cel_ctx = self.build_context(ctx, params, now)?;
        let program = self.compile(expr)?;
        let result = program
            .execute(&cel_ctx)
            .map_err(|e| ConditionError::Evaluation(format!("{e:?}")))?;
        Ok(cel_to_json(&result))
    }
}

/// Convert serde_json::Value to cel_interpreter::Value
fn json_to_cel(value: &JsonValue) -> CelValue {
    match value {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else if let Some(f) = n.as_f64() {
                CelValue::Float(f)
            } else {
                CelValue::Null
            }
        }
        JsonValue::String(s) => CelValue::String(s.clone().into()),
        JsonValue::Array(arr) => {
            let cel_vec: Vec<CelValue> = arr.iter().map(json_to_cel).collect();
            CelValue::List(cel_vec.into())
        }
        JsonValue::Object(obj) => {
            use cel_interpreter::objects::{Key, Map};

            let mut map_data: HashMap<Key, CelValue> = HashMap::new();
            for (k, v) in obj.iter() {
                map_data.insert(Key::from(k.clone()), json_to_cel(v));
            }
            CelValue::Map(Map {
                map: Arc::new(map_data),
            })
        }
    }
}

/// Convert cel_interpreter::Value to serde_json::Value
fn cel_to_json(value: &CelValue) -> JsonValue {
    match value {
        CelValue::Null => JsonValue::Null,
        CelValue::Bool(b) => JsonValue::Bool(*b),
        CelValue::Int(i) => JsonValue::Number((*i).into()),
        CelValue::UInt(u) => JsonValue::Number((*u).into()),
        CelValue::Float(f) => {
            if let Some(n) = serde_json::Number::from_f64(*f) {
                JsonValue::Number(n)
            } else {
                JsonValue::Null
            }
        }
        CelValue::String(s) => JsonValue::String(s.to_string()),
        CelValue::Bytes(b) => JsonValue::String(base64::encode(b.as_ref())),
        CelValue::List(list) => {
            let json_vec: Vec<JsonValue> = list.iter().map(cel_to_json).collect();
            JsonValue::Array(json_vec)
        }
        CelValue::Map(map) => {
            use cel_interpreter::objects::Key;

            let mut json_obj = serde_json::Map::new();
            for (k, v) in map.map.as_ref().iter() {
                let key_str = match k {
                    Key::String(s) => s.to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::Uint(u) => u.to_string(),
                    Key::Bool(b) => b.to_string(),
                };
                json_obj.insert(key_str, cel_to_json(v));
            }
            JsonValue::Object(json_obj)
        }
        _ => JsonValue::String(format!("{value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Variable;
    use crate::request::{CheckInput, Principal, Resource};

    fn test_context() -> EvalContext {
        let input = CheckInput {
            request_id: "req-1".into(),
            principal: Principal::new("alice", vec!["employee".into(), "manager".into()])
                .with_attr("department", json!("hr")),
            resource: Resource::new("leave_request", "XX125")
                .with_attr("owner", json!("alice"))
                .with_attr("status", json!("DRAFT")),
            actions: vec!["view".into()],
        };
        EvalContext::for_check_input(&input, &HashMap::new())
    }

    #[test]
    fn evaluates_simple_expressions() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let cond = Condition::Expr("true".into());
        assert!(evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap());

        let cond = Condition::Expr("false".into());
        assert!(!evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap());
    }

    #[test]
    fn evaluates_request_attributes() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let cond = Condition::Expr("request.principal.id == request.resource.attr.owner".into());
        assert!(evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap());

        let cond = Condition::Expr("P.attr.department == 'finance'".into());
        assert!(!evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap());
    }

    #[test]
    fn combinators_short_circuit() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let all = Condition::All(vec![
            Condition::Expr("'manager' in principal.roles".into()),
            Condition::Expr("resource.attr.status == 'DRAFT'".into()),
        ]);
        assert!(evaluator.check(&all, &ctx, &ParamSet::empty(), now).unwrap());

        let any = Condition::Any(vec![
            Condition::Expr("false".into()),
            Condition::Expr("principal.id == 'alice'".into()),
        ]);
        assert!(evaluator.check(&any, &ctx, &ParamSet::empty(), now).unwrap());

        let none = Condition::None(vec![Condition::Expr("principal.id == 'bob'".into())]);
        assert!(evaluator.check(&none, &ctx, &ParamSet::empty(), now).unwrap());
    }

    #[test]
    fn constants_and_variables_are_visible() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let mut constants = HashMap::new();
        constants.insert("max_days".to_string(), json!(10));
        let variables = vec![Variable {
            name: "is_owner".into(),
            expr: "principal.id == resource.attr.owner".into(),
        }];
        let params = ParamSet::new(&constants, &variables);

        let cond = Condition::All(vec![
            Condition::Expr("C.max_days == 10".into()),
            Condition::Expr("V.is_owner".into()),
        ]);
        assert!(evaluator.check(&cond, &ctx, &params, now).unwrap());
    }

    #[test]
    fn caches_compiled_programs() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let cond = Condition::Expr("true".into());
        evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap();
        assert_eq!(evaluator.cached_programs(), 1);

        evaluator.check(&cond, &ctx, &ParamSet::empty(), now).unwrap();
        assert_eq!(evaluator.cached_programs(), 1);

        evaluator.clear_cache();
        assert_eq!(evaluator.cached_programs(), 0);
    }

    #[test]
    fn rejects_non_boolean_conditions() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let cond = Condition::Expr("'hello'".into());
        let result = evaluator.check(&cond, &ctx, &ParamSet::empty(), now);
        assert!(matches!(result, Err(ConditionError::NonBooleanResult)));
    }

    #[test]
    fn output_expressions_produce_values() {
        let evaluator = CelConditionEvaluator::new();
        let ctx = test_context();
        let now = Utc::now();

        let val = evaluator
            .evaluate_output("principal.id", &ctx, &ParamSet::empty(), now)
            .unwrap();
        assert_eq!(val, json!("alice"));
    }
}
