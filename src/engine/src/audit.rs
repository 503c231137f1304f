//! Decision audit logging
//!
//! Every check and plan call produces a decision log entry. The sink is an
//! external capability: entries are built lazily so that a disabled sink
//! pays nothing, and a failing sink never fails the request (the engine
//! downgrades the failure to a warning).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;
use crate::plan::{PlanResourcesInput, PlanResourcesOutput};
use crate::policy::SourceAttributes;
use crate::request::{CheckInput, CheckOutput};

/// Generates a fresh call id.
pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Network peer that originated a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_for: Option<String>,
}

/// The policies that contributed to a decision, keyed by FQN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrail {
    #[serde(default)]
    pub effective_policies: HashMap<String, SourceAttributes>,
}

impl AuditTrail {
    pub fn add_policy(&mut self, fqn: impl Into<String>, attributes: SourceAttributes) {
        self.effective_policies.insert(fqn.into(), attributes);
    }

    /// Merges `other` into `self`; entries from `other` win on key clashes.
    pub fn merge(&mut self, other: AuditTrail) {
        if self.effective_policies.is_empty() {
            self.effective_policies = other.effective_policies;
            return;
        }
        self.effective_policies.extend(other.effective_policies);
    }
}

/// The operation a decision log entry describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "method")]
pub enum DecisionMethod {
    CheckResources {
        inputs: Vec<CheckInput>,
        outputs: Vec<CheckOutput>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PlanResources {
        input: PlanResourcesInput,
        output: Option<PlanResourcesOutput>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// One audit log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionLogEntry {
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<Peer>,
    #[serde(flatten)]
    pub method: DecisionMethod,
    #[serde(default)]
    pub audit_trail: AuditTrail,
    /// Caller-supplied metadata extracted from the request context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Lazily builds a decision log entry. Only invoked by sinks that actually
/// persist entries.
pub type EntryBuilder<'a> = Box<dyn FnOnce() -> Result<DecisionLogEntry> + Send + 'a>;

/// Decision log sink capability.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn write_decision_log_entry(&self, entry: EntryBuilder<'_>) -> Result<()>;
}

/// Sink that discards all entries.
#[derive(Debug, Default)]
pub struct NopLog;

#[async_trait]
impl AuditLog for NopLog {
    async fn write_decision_log_entry(&self, _entry: EntryBuilder<'_>) -> Result<()> {
        Ok(())
    }
}

/// Sink that emits entries to the `tracing` subscriber as structured JSON.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AuditLog for LogSink {
    async fn write_decision_log_entry(&self, entry: EntryBuilder<'_>) -> Result<()> {
        let entry = entry()?;
        let payload = serde_json::to_string(&entry)
            .map_err(|e| crate::error::EngineError::AuditLog(e.to_string()))?;
        tracing::info!(target: "verdict::audit", call_id = %entry.call_id, "{payload}");
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryLog {
    entries: parking_lot::Mutex<Vec<DecisionLogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DecisionLogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditLog for MemoryLog {
    async fn write_decision_log_entry(&self, entry: EntryBuilder<'_>) -> Result<()> {
        let entry = entry()?;
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trail_merge_prefers_newer_entries() {
        let mut a = AuditTrail::default();
        a.add_policy("verdict.resource.doc.vdefault", HashMap::new());

        let mut b = AuditTrail::default();
        let mut attrs = SourceAttributes::new();
        attrs.insert("driver".to_string(), json!("disk"));
        b.add_policy("verdict.resource.doc.vdefault", attrs.clone());
        b.add_policy("verdict.role.auditor", HashMap::new());

        a.merge(b);
        assert_eq!(a.effective_policies.len(), 2);
        assert_eq!(
            a.effective_policies["verdict.resource.doc.vdefault"],
            attrs
        );
    }

    #[tokio::test]
    async fn memory_log_captures_entries() {
        let log = MemoryLog::new();
        log.write_decision_log_entry(Box::new(|| {
            Ok(DecisionLogEntry {
                call_id: new_call_id(),
                timestamp: Utc::now(),
                peer: None,
                method: DecisionMethod::CheckResources {
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                    error: None,
                },
                audit_trail: AuditTrail::default(),
                metadata: None,
            })
        }))
        .await
        .unwrap();

        assert_eq!(log.entries().len(), 1);
    }
}
