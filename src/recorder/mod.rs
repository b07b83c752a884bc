//! The per-run decision trace: an append-only stream of structured events.
//!
//! Every run gets its own [`Recorder`], handed to the scheduler at
//! construction — there is no process-wide trace state. The recorder stamps
//! each event with the run id, a monotonic sequence number, and a timestamp,
//! then fans it out to the configured sinks. Downstream analysis (pattern
//! mining, failure root-causing) consumes the stream without the executor's
//! participation.
//!
//! Event vocabulary: *run-started*, *decision* (the options weighed and the
//! path committed to), *outcome* (what the committed path produced),
//! *problem* (a flagged anomaly), *run-ended*.

pub mod sink;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::ErrorKind;
use crate::llm::TokenUsage;

pub use sink::{ChannelSink, EventSink, MemorySink, SinkError, StdoutSink};

/// One candidate weighed in a decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
    /// What sort of option this is (an edge condition, a route, a retry...).
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pros: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cons: Vec<String>,
}

/// A commitment to one path, recorded at the moment it is made.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub node_id: String,
    pub intent: String,
    pub options: Vec<DecisionOption>,
    /// Id of the chosen option.
    pub chosen: String,
    pub reasoning: String,
}

/// What a committed path produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub decision_id: String,
    pub success: bool,
    pub result: Value,
    pub summary: String,
    pub latency_ms: u64,
    pub tokens: TokenUsage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A flagged anomaly, appended during execution for later analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remedy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// The event payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    RunStarted {
        goal: String,
        input: Value,
    },
    Decision(Decision),
    Outcome(Outcome),
    Problem(Problem),
    RunEnded {
        success: bool,
        narrative: String,
        outputs: Value,
    },
}

/// One event with its total-order envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub run_id: String,
    /// Monotonic within the run, starting at 0 and surviving resume.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Per-run handle that stamps and fans out events.
#[derive(Clone)]
pub struct Recorder {
    run_id: String,
    seq: Arc<AtomicU64>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl Recorder {
    /// Start a fresh trace under a newly-minted run id.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self::with_run_id(format!("run-{}", uuid::Uuid::new_v4()), sinks)
    }

    /// Continue (or begin) a trace under a known run id.
    #[must_use]
    pub fn with_run_id(run_id: impl Into<String>, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            run_id: run_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
            sinks: Arc::new(sinks),
        }
    }

    /// Continue a trace mid-sequence, as after loading a run snapshot.
    #[must_use]
    pub fn with_sequence(
        run_id: impl Into<String>,
        next_seq: u64,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            seq: Arc::new(AtomicU64::new(next_seq)),
            sinks: Arc::new(sinks),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sequence number the next event will carry.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RunEvent) {
        let recorded = RecordedEvent {
            run_id: self.run_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            event,
        };
        for sink in self.sinks.iter() {
            if let Err(error) = sink.emit(&recorded) {
                tracing::warn!(%error, run_id = %self.run_id, "event sink dropped an event");
            }
        }
    }

    pub fn run_started(&self, goal: impl Into<String>, input: Value) {
        self.emit(RunEvent::RunStarted {
            goal: goal.into(),
            input,
        });
    }

    /// Record a decision at the moment the node commits to a path. Returns
    /// the decision id for the matching outcome.
    pub fn record_decision(
        &self,
        node_id: impl Into<String>,
        intent: impl Into<String>,
        options: Vec<DecisionOption>,
        chosen: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> String {
        let id = format!("dec-{}", uuid::Uuid::new_v4());
        self.emit(RunEvent::Decision(Decision {
            id: id.clone(),
            node_id: node_id.into(),
            intent: intent.into(),
            options,
            chosen: chosen.into(),
            reasoning: reasoning.into(),
        }));
        id
    }

    pub fn record_outcome(
        &self,
        decision_id: impl Into<String>,
        success: bool,
        result: Value,
        summary: impl Into<String>,
        latency_ms: u64,
        tokens: TokenUsage,
    ) {
        self.emit(RunEvent::Outcome(Outcome {
            decision_id: decision_id.into(),
            success,
            result,
            summary: summary.into(),
            latency_ms,
            tokens,
        }));
    }

    pub fn record_problem(
        &self,
        severity: Severity,
        node_id: Option<String>,
        message: impl Into<String>,
        remedy: Option<String>,
        kind: Option<ErrorKind>,
    ) {
        self.emit(RunEvent::Problem(Problem {
            severity,
            node_id,
            message: message.into(),
            remedy,
            kind,
        }));
    }

    pub fn run_ended(&self, success: bool, narrative: impl Into<String>, outputs: Value) {
        self.emit(RunEvent::RunEnded {
            success,
            narrative: narrative.into(),
            outputs,
        });
    }
}

/// Convenience for building the outputs value of run-ended events.
#[must_use]
pub fn outputs_value(map: &FxHashMap<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_sequenced_per_run() {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::new(vec![sink.clone()]);

        recorder.run_started("demo", json!({"x": 1}));
        let decision = recorder.record_decision("a", "route", vec![], "e1", "only option");
        recorder.record_outcome(&decision, true, json!(null), "ok", 3, TokenUsage::default());
        recorder.run_ended(true, "done", json!({}));

        let events = sink.snapshot();
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
            assert_eq!(event.run_id, recorder.run_id());
        }
        assert!(matches!(events[0].event, RunEvent::RunStarted { .. }));
        assert!(matches!(events[3].event, RunEvent::RunEnded { .. }));
    }

    #[test]
    fn resumed_recorder_continues_the_sequence() {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::with_sequence("run-1", 7, vec![sink.clone()]);
        recorder.record_problem(Severity::Info, None, "resumed", None, None);
        assert_eq!(sink.snapshot()[0].seq, 7);
    }

    #[test]
    fn serialized_event_carries_type_tag() {
        let event = RecordedEvent {
            run_id: "run-1".to_string(),
            seq: 0,
            at: Utc::now(),
            event: RunEvent::Problem(Problem {
                severity: Severity::Warning,
                node_id: Some("n".to_string()),
                message: "m".to_string(),
                remedy: None,
                kind: Some(ErrorKind::ToolError),
            }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "problem");
        assert_eq!(value["kind"], "tool-error");
    }
}
