//! # Verdict Decision Engine
//!
//! Scoped authorization decision engine: given a principal, a resource and a
//! set of actions, it resolves an ALLOW/DENY effect per action, and can
//! separately produce a symbolic query plan for partial authorization.
//!
//! ## Features
//!
//! - **Rule table** indexing of compiled resource and role policies with
//!   scope inheritance and role hierarchies
//! - **Two-layer evaluation** (principal policy first, rule table second)
//!   with first-resolver-wins merging and default-deny
//! - **CEL conditions** with compiled-program caching
//! - **Bounded-concurrency batches** over a fixed worker pool
//! - **Decision audit log** entries for every call, built lazily
//! - **Incremental maintenance** driven by policy store events
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cretoai_verdict::{
//!     CheckInput, CheckOptions, Components, Engine, EngineConf, MemoryPolicyLoader, Principal,
//!     RequestContext, Resource, RuleTable,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loader = Arc::new(MemoryPolicyLoader::new());
//!     let table = Arc::new(RuleTable::new().with_policy_loader(loader.clone()));
//!
//!     let engine = Engine::new(
//!         EngineConf::default(),
//!         Components::new(loader).with_rule_table(table),
//!     );
//!
//!     let outputs = engine
//!         .check(
//!             &RequestContext::new(),
//!             &[CheckInput {
//!                 request_id: "req-1".into(),
//!                 principal: Principal::new("alice", vec!["employee".into()]),
//!                 resource: Resource::new("leave_request", "XX125"),
//!                 actions: vec!["view".into()],
//!             }],
//!             CheckOptions::new(),
//!         )
//!         .await?;
//!
//!     println!("view: {:?}", outputs[0].actions["view"].effect);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod loader;
pub mod matcher;
pub mod namer;
pub mod plan;
pub mod policy;
pub mod request;
pub mod ruletable;
pub mod schema;
pub mod tracer;

// Re-export commonly used types
pub use audit::{AuditLog, AuditTrail, DecisionLogEntry, LogSink, MemoryLog, NopLog, Peer};
pub use conditions::{CelConditionEvaluator, ConditionError, ConditionEvaluator, EvalContext};
pub use config::EngineConf;
pub use engine::{CheckOptions, Components, Engine, MetadataExtractor, RequestContext};
pub use error::{EngineError, Result};
pub use evaluator::{EffectInfo, EvalParams, Evaluator, PolicyEvalResult};
pub use loader::{EventKind, MemoryPolicyLoader, PolicyLoader, StorageEvent, Subscriber};
pub use namer::ModuleId;
pub use plan::{
    PlanFilter, PlanResource, PlanResourcesInput, PlanResourcesOutput, PolicyPlanResult,
    QueryPlanner, StructuralPlanner,
};
pub use policy::{Condition, Effect, PolicySet, ScopePermissions};
pub use request::{ActionEffect, CheckInput, CheckOutput, Principal, Resource};
pub use ruletable::{RuleSet, RuleTable, RuleTableRow};
pub use schema::{PolicySchemas, SchemaValidator, ValidationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
