//! Decision engine: request orchestration, batch execution, planning
//!
//! The engine resolves the principal and resource policy layers for each
//! request, chains them in an evaluation context, and runs batches either
//! serially or across a fixed worker pool. Every call produces a decision
//! log entry through the audit capability; audit failures never fail the
//! request.

mod worker;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::worker::{spawn_worker, WorkItem, WorkOut, PARALLELISM_THRESHOLD, WORKER_QUEUE_SIZE};
use crate::audit::{
    new_call_id, AuditLog, AuditTrail, DecisionLogEntry, DecisionMethod, EntryBuilder, NopLog,
    Peer,
};
use crate::conditions::{CelConditionEvaluator, ConditionEvaluator};
use crate::config::EngineConf;
use crate::error::{EngineError, Result};
use crate::evaluator::{
    EvalParams, EvaluationCtx, Evaluator, PrincipalPolicyEvaluator, RuleTableEvaluator,
    DEFAULT_EFFECT, NO_POLICY_MATCH,
};
use crate::loader::PolicyLoader;
use crate::namer::{self, ModuleId};
use crate::plan::{PlanResourcesInput, PlanResourcesOutput, PolicyPlanResult, QueryPlanner, StructuralPlanner};
use crate::policy::{PolicySet, ScopePermissions};
use crate::request::{ActionEffect, CheckInput, CheckOutput};
use crate::ruletable::RuleTable;
use crate::schema::{NopValidator, SchemaValidator};
use crate::tracer::{Sink, TraceContext};

/// Extracts caller-supplied audit metadata from the request context.
pub type MetadataExtractor = Arc<dyn Fn(&RequestContext) -> HashMap<String, Value> + Send + Sync>;

/// Per-call context: identity for the audit trail plus cancellation.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub call_id: Option<String>,
    pub peer: Option<Peer>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Per-call overrides of the engine defaults.
#[derive(Clone, Default)]
pub struct CheckOptions {
    trace_sink: Option<Arc<dyn Sink>>,
    now: Option<DateTime<Utc>>,
    lenient_scope_search: Option<bool>,
    globals: Option<HashMap<String, Value>>,
    default_policy_version: Option<String>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    /// Fixes `now` for condition evaluation. The same timestamp is used for
    /// every rule in the call.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_lenient_scope_search(mut self) -> Self {
        self.lenient_scope_search = Some(true);
        self
    }

    pub fn with_globals(mut self, globals: HashMap<String, Value>) -> Self {
        self.globals = Some(globals);
        self
    }

    pub fn with_default_policy_version(mut self, version: impl Into<String>) -> Self {
        self.default_policy_version = Some(version.into());
        self
    }

    fn resolve(&self, conf: &EngineConf) -> (EvalParams, TraceContext) {
        let params = EvalParams {
            globals: self.globals.clone().unwrap_or_else(|| conf.globals.clone()),
            now: self.now.unwrap_or_else(Utc::now),
            default_policy_version: self
                .default_policy_version
                .clone()
                .unwrap_or_else(|| conf.default_policy_version.clone()),
            lenient_scope_search: self
                .lenient_scope_search
                .unwrap_or(conf.lenient_scope_search),
        };
        (params, TraceContext::new(self.trace_sink.clone()))
    }
}

/// Collaborators the engine is assembled from. Optional slots fall back to
/// the built-in implementations.
pub struct Components {
    pub policy_loader: Arc<dyn PolicyLoader>,
    /// Preloaded global rule table. Without one, the engine builds transient
    /// scope-scoped tables per request.
    pub rule_table: Option<Arc<RuleTable>>,
    pub schema_validator: Option<Arc<dyn SchemaValidator>>,
    pub conditions: Option<Arc<dyn ConditionEvaluator>>,
    pub planner: Option<Arc<dyn QueryPlanner>>,
    pub audit_log: Option<Arc<dyn AuditLog>>,
    pub metadata_extractor: Option<MetadataExtractor>,
}

impl Components {
    pub fn new(policy_loader: Arc<dyn PolicyLoader>) -> Self {
        Self {
            policy_loader,
            rule_table: None,
            schema_validator: None,
            conditions: None,
            planner: None,
            audit_log: None,
            metadata_extractor: None,
        }
    }

    pub fn with_rule_table(mut self, table: Arc<RuleTable>) -> Self {
        self.rule_table = Some(table);
        self
    }

    pub fn with_audit_log(mut self, log: Arc<dyn AuditLog>) -> Self {
        self.audit_log = Some(log);
        self
    }

    pub fn with_schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema_validator = Some(validator);
        self
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_metadata_extractor(mut self, extractor: MetadataExtractor) -> Self {
        self.metadata_extractor = Some(extractor);
        self
    }
}

/// Shared engine state; workers hold a handle to it.
pub(crate) struct EngineCore {
    conf: EngineConf,
    policy_loader: Arc<dyn PolicyLoader>,
    rule_table: Option<Arc<RuleTable>>,
    schema_validator: Arc<dyn SchemaValidator>,
    conditions: Arc<dyn ConditionEvaluator>,
    planner: Arc<dyn QueryPlanner>,
    audit_log: Arc<dyn AuditLog>,
    metadata_extractor: Option<MetadataExtractor>,
}

/// Top-level decision engine.
pub struct Engine {
    core: Arc<EngineCore>,
    workers: Vec<mpsc::Sender<WorkItem>>,
    worker_index: AtomicU64,
    shutdown: CancellationToken,
}

impl Engine {
    /// Creates an engine and spawns its worker pool. Must be called within a
    /// tokio runtime when `conf.num_workers > 0`.
    pub fn new(conf: EngineConf, components: Components) -> Self {
        let num_workers = conf.num_workers;
        let core = Arc::new(EngineCore {
            conf,
            policy_loader: components.policy_loader,
            rule_table: components.rule_table,
            schema_validator: components
                .schema_validator
                .unwrap_or_else(|| Arc::new(NopValidator)),
            conditions: components
                .conditions
                .unwrap_or_else(|| Arc::new(CelConditionEvaluator::new())),
            planner: components
                .planner
                .unwrap_or_else(|| Arc::new(StructuralPlanner)),
            audit_log: components.audit_log.unwrap_or_else(|| Arc::new(NopLog)),
            metadata_extractor: components.metadata_extractor,
        });

        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_SIZE);
            workers.push(tx);
            spawn_worker(core.clone(), rx, shutdown.clone());
        }

        Self {
            core,
            workers,
            worker_index: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Creates an engine without a worker pool or audit log, for one-shot
    /// embedded use.
    pub fn ephemeral(policy_loader: Arc<dyn PolicyLoader>) -> Self {
        let conf = EngineConf {
            num_workers: 0,
            ..EngineConf::default()
        };
        Self::new(conf, Components::new(policy_loader))
    }

    /// Stops the worker pool. Also triggered by dropping the engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Evaluates a batch of check requests, preserving input order.
    ///
    /// Batches below the parallelism threshold (or with no worker pool) run
    /// serially. Any item error aborts the whole batch. A decision log
    /// entry is always attempted; audit failures are downgraded to warnings.
    pub async fn check(
        &self,
        ctx: &RequestContext,
        inputs: &[CheckInput],
        opts: CheckOptions,
    ) -> Result<Vec<CheckOutput>> {
        let (params, tctx) = opts.resolve(&self.core.conf);

        let outcome = if inputs.len() < PARALLELISM_THRESHOLD || self.workers.is_empty() {
            self.check_serial(ctx, inputs, &params, &tctx).await
        } else {
            self.check_parallel(ctx, inputs, &params, &tctx).await
        };

        self.log_check_decision(ctx, inputs, &outcome).await;

        outcome.map(|(outputs, _)| outputs)
    }

    async fn check_serial(
        &self,
        ctx: &RequestContext,
        inputs: &[CheckInput],
        params: &EvalParams,
        tctx: &TraceContext,
    ) -> Result<(Vec<CheckOutput>, AuditTrail)> {
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut trail = AuditTrail::default();

        for input in inputs {
            if ctx.cancellation.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (output, t) = self.core.evaluate_input(input, params, tctx).await?;
            outputs.push(output);
            trail.merge(t);
        }

        Ok((outputs, trail))
    }

    async fn check_parallel(
        &self,
        ctx: &RequestContext,
        inputs: &[CheckInput],
        params: &EvalParams,
        tctx: &TraceContext,
    ) -> Result<(Vec<CheckOutput>, AuditTrail)> {
        let (collector, mut results) = mpsc::channel::<WorkOut>(inputs.len());

        for (index, input) in inputs.iter().enumerate() {
            self.submit_work(
                ctx,
                WorkItem {
                    index,
                    input: input.clone(),
                    params: params.clone(),
                    tctx: tctx.clone(),
                    cancellation: ctx.cancellation.clone(),
                    out: collector.clone(),
                },
            )
            .await?;
        }
        drop(collector);

        let mut outputs: Vec<Option<CheckOutput>> = vec![None; inputs.len()];
        let mut trail = AuditTrail::default();

        for _ in 0..inputs.len() {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(EngineError::Cancelled),
                work_out = results.recv() => {
                    let Some(work_out) = work_out else {
                        return Err(EngineError::Internal("worker result channel closed".into()));
                    };
                    let (output, t) = work_out.result?;
                    outputs[work_out.index] = Some(output);
                    trail.merge(t);
                }
            }
        }

        let outputs: Option<Vec<CheckOutput>> = outputs.into_iter().collect();
        let outputs = outputs
            .ok_or_else(|| EngineError::Internal("incomplete batch result".into()))?;

        Ok((outputs, trail))
    }

    /// Submits one work item, selecting the target worker round-robin.
    /// Blocks when the worker's queue is full; returns immediately on
    /// cancellation.
    async fn submit_work(&self, ctx: &RequestContext, item: WorkItem) -> Result<()> {
        let num_workers = self.workers.len() as u64;
        let index =
            (self.worker_index.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % num_workers) as usize;

        tokio::select! {
            sent = self.workers[index].send(item) => {
                sent.map_err(|_| EngineError::Internal("worker pool is not accepting work".into()))
            }
            _ = ctx.cancellation.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Produces a symbolic plan describing which resource instances the
    /// principal could act on.
    pub async fn plan_resources(
        &self,
        ctx: &RequestContext,
        input: &PlanResourcesInput,
        opts: CheckOptions,
    ) -> Result<PlanResourcesOutput> {
        let (params, _) = opts.resolve(&self.core.conf);

        let outcome = self.do_plan_resources(ctx, input, &params).await;
        self.log_plan_decision(ctx, input, &outcome).await;

        outcome.map(|(output, _)| output)
    }

    async fn do_plan_resources(
        &self,
        ctx: &RequestContext,
        input: &PlanResourcesInput,
        params: &EvalParams,
    ) -> Result<(PlanResourcesOutput, AuditTrail)> {
        if ctx.cancellation.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let core = &self.core;
        let mut trail = AuditTrail::default();

        let (pp_name, pp_version, pp_scope) = policy_attr(
            &input.principal.id,
            &input.principal.policy_version,
            &input.principal.scope,
            params,
        );
        let principal_set = core
            .get_principal_policy_set(pp_name, pp_version, pp_scope, params.lenient_scope_search)
            .await?;

        let mut result = PolicyPlanResult::new();
        if let Some(set) = &principal_set {
            if let PolicySet::Principal(pp) = set.as_ref() {
                result = core.planner.plan_principal_policy(pp, input, params)?;
                trail.add_policy(pp.meta.fqn.clone(), pp.meta.source_attributes.clone());
            }
        }

        let table = match &core.rule_table {
            Some(table) => Some(table.clone()),
            None => {
                let version = if input.resource.policy_version.is_empty() {
                    params.default_policy_version.clone()
                } else {
                    input.resource.policy_version.clone()
                };
                core.get_partial_rule_table(
                    &input.resource.kind,
                    &version,
                    &input.resource.scope,
                    &input.principal.roles,
                )
                .await?
            }
        };

        if let Some(table) = table {
            let table_plan = core.planner.plan_rule_table(&table, input, params)?;
            result = core.planner.combine(result, table_plan);
        }

        // a plan that can never allow but sometimes denies is meaningless as
        // a conditional filter
        if result.allow_is_empty() && !result.deny_is_empty() {
            result.reset_to_unconditional_deny();
        }

        let mut output = result.to_output(input);
        if result.is_empty() {
            output.filter_debug = Some(NO_POLICY_MATCH.to_string());
        }

        Ok((output, trail))
    }

    async fn log_check_decision(
        &self,
        ctx: &RequestContext,
        inputs: &[CheckInput],
        outcome: &Result<(Vec<CheckOutput>, AuditTrail)>,
    ) {
        let core = &self.core;
        let builder: EntryBuilder<'_> = Box::new(move || {
            let (outputs, trail, error) = match outcome {
                Ok((outputs, trail)) => (outputs.clone(), trail.clone(), None),
                Err(err) => (Vec::new(), AuditTrail::default(), Some(err.to_string())),
            };

            Ok(DecisionLogEntry {
                call_id: ctx.call_id.clone().unwrap_or_else(new_call_id),
                timestamp: Utc::now(),
                peer: ctx.peer.clone(),
                method: DecisionMethod::CheckResources {
                    inputs: inputs.to_vec(),
                    outputs,
                    error,
                },
                audit_trail: trail,
                metadata: core.metadata_extractor.as_ref().map(|extract| extract(ctx)),
            })
        });

        if let Err(err) = core.audit_log.write_decision_log_entry(builder).await {
            warn!(error = %err, "Failed to log decision");
        }
    }

    async fn log_plan_decision(
        &self,
        ctx: &RequestContext,
        input: &PlanResourcesInput,
        outcome: &Result<(PlanResourcesOutput, AuditTrail)>,
    ) {
        let core = &self.core;
        let builder: EntryBuilder<'_> = Box::new(move || {
            let (output, trail, error) = match outcome {
                Ok((output, trail)) => (Some(output.clone()), trail.clone(), None),
                Err(err) => (None, AuditTrail::default(), Some(err.to_string())),
            };

            Ok(DecisionLogEntry {
                call_id: ctx.call_id.clone().unwrap_or_else(new_call_id),
                timestamp: Utc::now(),
                peer: ctx.peer.clone(),
                method: DecisionMethod::PlanResources {
                    input: input.clone(),
                    output,
                    error,
                },
                audit_trail: trail,
                metadata: core.metadata_extractor.as_ref().map(|extract| extract(ctx)),
            })
        });

        if let Err(err) = core.audit_log.write_decision_log_entry(builder).await {
            warn!(error = %err, "Failed to log decision");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl EngineCore {
    /// Evaluates one input through the evaluation chain and assembles its
    /// output.
    pub(crate) async fn evaluate_input(
        &self,
        input: &CheckInput,
        params: &EvalParams,
        tctx: &TraceContext,
    ) -> Result<(CheckOutput, AuditTrail)> {
        let ec = self.build_evaluation_ctx(input, params).await?;
        if ec.num_checks() == 0 {
            debug!(
                principal = %input.principal.id,
                resource = %input.resource.kind,
                "No principal or resource policies found"
            );
        }

        let result = ec.evaluate(input, tctx)?;

        let mut actions = HashMap::with_capacity(input.actions.len());
        for action in &input.actions {
            let action_effect = match result.effects.get(action) {
                Some(info) => ActionEffect {
                    effect: info.effect,
                    policy: info.policy.clone(),
                    scope: info.scope.clone(),
                },
                None => ActionEffect {
                    effect: DEFAULT_EFFECT,
                    policy: NO_POLICY_MATCH.to_string(),
                    scope: String::new(),
                },
            };
            actions.insert(action.clone(), action_effect);
        }

        let mut effective_derived_roles: Vec<String> =
            result.effective_derived_roles.into_iter().collect();
        effective_derived_roles.sort();

        let output = CheckOutput {
            request_id: input.request_id.clone(),
            resource_id: input.resource.id.clone(),
            actions,
            effective_derived_roles,
            validation_errors: result.validation_errors,
            outputs: result.outputs,
        };

        Ok((output, result.audit_trail))
    }

    async fn build_evaluation_ctx(
        &self,
        input: &CheckInput,
        params: &EvalParams,
    ) -> Result<EvaluationCtx> {
        let mut ec = EvaluationCtx::new();

        let (pp_name, pp_version, pp_scope) = policy_attr(
            &input.principal.id,
            &input.principal.policy_version,
            &input.principal.scope,
            params,
        );
        let principal_set = self
            .get_principal_policy_set(pp_name, pp_version, pp_scope, params.lenient_scope_search)
            .await?;
        if let Some(set) = principal_set {
            if let PolicySet::Principal(pp) = set.as_ref() {
                ec.add_check(Some(Evaluator::PrincipalPolicy(PrincipalPolicyEvaluator::new(
                    Arc::new(pp.clone()),
                    self.conditions.clone(),
                    params.clone(),
                ))));
            }
        }

        let (rp_name, rp_version, rp_scope) = policy_attr(
            &input.resource.kind,
            &input.resource.policy_version,
            &input.resource.scope,
            params,
        );
        let table = match &self.rule_table {
            Some(table) => Some(table.clone()),
            None => {
                self.get_partial_rule_table(rp_name, rp_version, rp_scope, &input.principal.roles)
                    .await?
            }
        };
        if let Some(table) = table {
            ec.add_check(Some(Evaluator::RuleTable(RuleTableEvaluator::new(
                table,
                self.schema_validator.clone(),
                self.conditions.clone(),
                params.clone(),
            ))));
        }

        Ok(ec)
    }

    async fn get_principal_policy_set(
        &self,
        principal: &str,
        policy_version: &str,
        scope: &str,
        lenient_scope_search: bool,
    ) -> Result<Option<Arc<PolicySet>>> {
        let ids = namer::scoped_principal_policy_module_ids(
            principal,
            policy_version,
            scope,
            lenient_scope_search,
        );
        self.policy_loader.get_first_match(&ids).await.map_err(|err| {
            EngineError::PolicyLoader(format!(
                "failed to get check for [{principal}.{policy_version}]: {err}"
            ))
        })
    }

    /// Builds a transient, scope-scoped rule table for a single request.
    ///
    /// Walks the scope chain most specific first; every level must
    /// contribute at least one resource or role policy, otherwise there is
    /// no match and no evaluator. Resource policy sets are truncated to
    /// their first (most specific) policy unit because each level is loaded
    /// individually.
    async fn get_partial_rule_table(
        &self,
        resource: &str,
        policy_version: &str,
        scope: &str,
        input_roles: &[String],
    ) -> Result<Option<Arc<RuleTable>>> {
        let mut to_load: Vec<Arc<PolicySet>> = Vec::new();

        for scope_level in namer::scope_chain(scope) {
            let resource_ids = namer::scoped_resource_policy_module_ids(
                resource,
                policy_version,
                &scope_level,
                true,
            );
            let resource_set = self
                .policy_loader
                .get_first_match(&resource_ids)
                .await
                .map_err(|err| {
                    EngineError::PolicyLoader(format!(
                        "failed to get check for [{resource}.{policy_version}]: {err}"
                    ))
                })?;

            let resource_set = resource_set.and_then(|set| {
                set.as_resource().map(|rp| {
                    let mut truncated = rp.clone();
                    truncated.policies.truncate(1);
                    Arc::new(PolicySet::Resource(truncated))
                })
            });

            let role_sets = self.get_role_policy_sets(&scope_level, input_roles).await?;

            if resource_set.is_none() && role_sets.is_empty() {
                return Ok(None);
            }

            if let Some(set) = resource_set {
                to_load.push(set);
            }
            to_load.extend(role_sets);
        }

        let table = RuleTable::new();
        table.load_policies(&to_load);

        Ok(Some(Arc::new(table)))
    }

    /// Collects the role policies for `roles` at `scope`, recursively
    /// following parent roles. Conflicting scope-permission modes within the
    /// scope are a hard configuration error.
    async fn get_role_policy_sets(
        &self,
        scope: &str,
        roles: &[String],
    ) -> Result<Vec<Arc<PolicySet>>> {
        let mut require_parental_consent = 0usize;
        let mut override_parent = 0usize;
        let mut processed: HashSet<String> = HashSet::new();
        let mut pending: Vec<String> = roles.to_vec();
        let mut sets = Vec::new();

        while !pending.is_empty() {
            let ids: Vec<ModuleId> = pending
                .drain(..)
                .filter(|role| processed.insert(role.clone()))
                .map(|role| namer::role_policy_module_id(&role, scope))
                .collect();

            if ids.is_empty() {
                break;
            }

            let current = self
                .policy_loader
                .get_all_matching(&ids)
                .await
                .map_err(|err| EngineError::PolicyLoader(err.to_string()))?;

            for set in current {
                let Some(role_policy) = set.as_role() else {
                    continue;
                };

                pending.extend(role_policy.parent_roles.iter().cloned());

                match role_policy.scope_permissions {
                    ScopePermissions::RequireParentalConsentForAllows => {
                        require_parental_consent += 1;
                    }
                    ScopePermissions::OverrideParent => override_parent += 1,
                    ScopePermissions::Unspecified => {}
                }

                if require_parental_consent > 0 && override_parent > 0 {
                    return Err(EngineError::Configuration(
                        "invalid scope permissions: role policies cannot combine different scope permissions within the same scope"
                            .into(),
                    ));
                }

                sets.push(set);
            }
        }

        Ok(sets)
    }
}

fn policy_attr<'a>(
    name: &'a str,
    version: &'a str,
    scope: &'a str,
    params: &'a EvalParams,
) -> (&'a str, &'a str, &'a str) {
    let version = if version.is_empty() {
        params.default_policy_version.as_str()
    } else {
        version
    };
    (name, version, scope)
}
