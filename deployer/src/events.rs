//! Events is the structured progress and debug stream executors emit.
//!
//! Events are purely additive: nothing consumes them to make decisions, and
//! dropping the callback changes no outcome. Per-resource order is preserved;
//! across resources events interleave but carry a monotonic sequence.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use api::{client::AppliedRecord, resource::ReadyStatus};

use crate::{
    options::{DebugLogging, ProgressCallback},
    rollback::{RollbackItem, RollbackStatus},
};

/// ResourcePhase is the per-resource state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[allow(missing_docs)]
pub enum ResourcePhase {
    Pending,
    Resolving,
    Applying,
    Created,
    WaitingReady,
    Ready,
    Failed,
    RolledBack,
    Skipped,
}

impl ResourcePhase {
    /// Is_terminal reports whether the phase ends the resource's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Failed | Self::RolledBack | Self::Skipped
        )
    }
}

/// EventKind is the payload of one deploy event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Progress reports a per-resource phase change.
    Progress {
        /// Graph member id.
        resource_id: String,
        /// New phase.
        phase: ResourcePhase,
        /// Optional elaboration.
        message: Option<String>,
    },
    /// Rollback summarizes a finished rollback pass.
    Rollback {
        /// Aggregate outcome.
        status: RollbackStatus,
        /// Per-record outcomes, in deletion order.
        items: Vec<RollbackItem>,
    },
    /// Completed reports a successful deploy.
    Completed {
        /// Number of applied records.
        applied: usize,
    },
    /// Failed reports a failed deploy.
    Failed {
        /// Failing member, when one is identifiable.
        resource_id: Option<String>,
        /// Failure rendering.
        error: String,
        /// Kubernetes Events collected around the failure, when monitoring
        /// is enabled.
        cluster_events: Vec<Value>,
    },
    /// StatusDebug reports one readiness poll attempt.
    StatusDebug {
        /// Graph member id.
        resource_id: String,
        /// Last observed status object, truncated to the configured cap.
        current_status: Value,
        /// Evaluator verdict, when one ran.
        readiness: Option<ReadyStatus>,
        /// Poll attempt counter.
        attempt: u32,
        /// Elapsed wait in milliseconds.
        elapsed_ms: u64,
        /// Whether the deadline has passed.
        is_timeout: bool,
        /// Poll error, when the read failed.
        error: Option<String>,
    },
}

impl EventKind {
    /// Name reports the wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Rollback { .. } => "rollback",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::StatusDebug { .. } => "status-debug",
        }
    }
}

/// DeployEvent is one emitted event with its ordering envelope.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    /// Sequence is monotonic across the whole deploy.
    pub sequence: u64,
    /// Timestamp of emission.
    pub timestamp: DateTime<Utc>,
    /// Kind is the payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// EventSink hands events to the configured callback and stamps the ordering
/// envelope.
#[derive(Clone)]
pub struct EventSink {
    seq: Arc<AtomicU64>,
    callback: Option<ProgressCallback>,
    debug: DebugLogging,
}

impl EventSink {
    /// New constructs a sink.
    pub fn new(callback: Option<ProgressCallback>, debug: DebugLogging) -> Self {
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            callback,
            debug,
        }
    }

    /// Disabled constructs a sink that drops everything.
    pub fn disabled() -> Self {
        Self::new(None, DebugLogging::default())
    }

    /// Emit stamps and delivers an event.
    pub fn emit(&self, kind: EventKind) {
        let Some(cb) = &self.callback else { return };
        let ev = DeployEvent {
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        cb(&ev);
    }

    /// Progress emits a phase-change event.
    pub fn progress<S: Into<String>>(
        &self,
        resource_id: S,
        phase: ResourcePhase,
        message: Option<String>,
    ) {
        self.emit(EventKind::Progress {
            resource_id: resource_id.into(),
            phase,
            message,
        });
    }

    /// Status_debug emits a poll-attempt event when debug logging is on.
    #[allow(clippy::too_many_arguments)]
    pub fn status_debug(
        &self,
        resource_id: &str,
        current_status: &Value,
        readiness: Option<&ReadyStatus>,
        attempt: u32,
        elapsed_ms: u64,
        is_timeout: bool,
        error: Option<String>,
    ) {
        if !self.debug.enabled {
            return;
        }
        let gate = match (&error, &readiness) {
            (Some(_), _) => true,
            (None, Some(_)) => self.debug.readiness_evaluation,
            (None, None) => self.debug.status_polling,
        };
        if !gate {
            return;
        }
        self.emit(EventKind::StatusDebug {
            resource_id: resource_id.to_string(),
            current_status: truncate_value(
                current_status,
                self.debug.max_status_object_size,
            ),
            readiness: readiness.cloned(),
            attempt,
            elapsed_ms,
            is_timeout,
            error,
        });
    }

    /// Rolled_back emits the per-record progress event for one deletion.
    pub fn rolled_back(&self, record: &AppliedRecord, error: Option<&str>) {
        let id = record
            .resource_id
            .clone()
            .unwrap_or_else(|| record.name.clone());
        match error {
            None => self.progress(id, ResourcePhase::RolledBack, Some(record.to_string())),
            Some(e) => self.progress(id, ResourcePhase::Failed, Some(e.to_string())),
        }
    }

    /// Debug_config reports the sink's debug settings.
    pub fn debug_config(&self) -> &DebugLogging {
        &self.debug
    }
}

/// Truncate_value bounds a value's serialized size, truncating strings and
/// pruning container tails rather than dropping the value.
pub fn truncate_value(v: &Value, max_bytes: usize) -> Value {
    if serialized_len(v) <= max_bytes {
        return v.clone();
    }
    match v {
        Value::String(s) => {
            let keep: String = s.chars().take(max_bytes.saturating_div(2).max(8)).collect();
            Value::String(format!("{keep}…(truncated)"))
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            let mut used = 2usize;
            for item in items {
                let child_budget = max_bytes.saturating_sub(used).saturating_div(2);
                if child_budget < 8 {
                    out.push(Value::String("…(truncated)".into()));
                    break;
                }
                let t = truncate_value(item, child_budget);
                used = used.saturating_add(serialized_len(&t)).saturating_add(1);
                out.push(t);
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            let mut used = 2usize;
            for (k, item) in map {
                let child_budget = max_bytes.saturating_sub(used).saturating_div(2);
                if child_budget < 8 {
                    out.insert("…".into(), Value::String("(truncated)".into()));
                    break;
                }
                let t = truncate_value(item, child_budget);
                used = used
                    .saturating_add(serialized_len(&t))
                    .saturating_add(k.len())
                    .saturating_add(4);
                out.insert(k.clone(), t);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn serialized_len(v: &Value) -> usize {
    serde_json::to_string(v).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sequence_is_monotonic() {
        let seen: Arc<Mutex<Vec<u64>>> = Arc::default();
        let cb_seen = seen.clone();
        let sink = EventSink::new(
            Some(Arc::new(move |ev: &DeployEvent| {
                cb_seen.lock().unwrap().push(ev.sequence);
            })),
            DebugLogging::default(),
        );
        for _ in 0..5 {
            sink.progress("a", ResourcePhase::Pending, None);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn small_values_pass_untouched() {
        let v = serde_json::json!({"a": 1, "b": "xy"});
        assert_eq!(truncate_value(&v, 1024), v);
    }

    #[test]
    fn oversized_values_truncate_not_drop() {
        let big = "x".repeat(10_000);
        let v = serde_json::json!({"log": big, "n": 1});
        let t = truncate_value(&v, 256);
        assert!(serialized_len(&t) < 1024);
        let log = t["log"].as_str().unwrap();
        assert!(log.ends_with("…(truncated)"));
        assert!(log.starts_with('x'));
    }

    #[test]
    fn event_names_are_wire_names() {
        assert_eq!(
            EventKind::Completed { applied: 0 }.name(),
            "completed",
        );
        assert_eq!(
            EventKind::StatusDebug {
                resource_id: "x".into(),
                current_status: Value::Null,
                readiness: None,
                attempt: 1,
                elapsed_ms: 0,
                is_timeout: false,
                error: None,
            }
            .name(),
            "status-debug",
        );
    }
}
