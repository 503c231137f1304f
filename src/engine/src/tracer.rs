//! Per-action decision tracing
//!
//! Evaluators emit a trace event for every decision they take so that
//! "why was this denied" is answerable without re-running the request.
//! The sink is optional; with no sink attached tracing is a no-op.

use std::sync::Arc;

use crate::policy::Effect;

/// A single trace event recorded during evaluation.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub action: String,
    pub effect: Option<Effect>,
    pub policy_key: Option<String>,
    pub message: String,
}

/// Receives trace events.
pub trait Sink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Sink that forwards trace events to the `tracing` subscriber at debug
/// level.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn record(&self, event: TraceEvent) {
        tracing::debug!(
            action = %event.action,
            effect = ?event.effect,
            policy = event.policy_key.as_deref().unwrap_or(""),
            "{}",
            event.message
        );
    }
}

/// Sink that collects events in memory. Used by tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }
}

impl Sink for CollectingSink {
    fn record(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

/// Handle evaluators use to emit trace events.
#[derive(Clone, Default)]
pub struct TraceContext {
    sink: Option<Arc<dyn Sink>>,
}

impl TraceContext {
    pub fn new(sink: Option<Arc<dyn Sink>>) -> Self {
        Self { sink }
    }

    pub fn start_action<'a>(&'a self, action: &'a str) -> ActionTrace<'a> {
        ActionTrace {
            sink: self.sink.as_deref(),
            action,
        }
    }
}

/// Trace handle scoped to one action.
pub struct ActionTrace<'a> {
    sink: Option<&'a dyn Sink>,
    action: &'a str,
}

impl ActionTrace<'_> {
    pub fn applied_effect(&self, effect: Effect, policy_key: &str, message: &str) {
        self.emit(Some(effect), Some(policy_key.to_string()), message);
    }

    pub fn condition_not_satisfied(&self, policy_key: &str) {
        self.emit(
            None,
            Some(policy_key.to_string()),
            "Condition not satisfied",
        );
    }

    pub fn note(&self, message: &str) {
        self.emit(None, None, message);
    }

    fn emit(&self, effect: Option<Effect>, policy_key: Option<String>, message: &str) {
        if let Some(sink) = self.sink {
            sink.record(TraceEvent {
                action: self.action.to_string(),
                effect,
                policy_key,
                message: message.to_string(),
            });
        }
    }
}
