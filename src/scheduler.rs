//! The per-run scheduler: a single-threaded cooperative state machine.
//!
//! One scheduler instance drives one run, one node at a time. Each iteration
//! makes a scheduling decision: check the visit cap, verify the node's input
//! contract, dispatch to an executor, commit the buffered writes atomically,
//! then select the next edge by condition and priority. Pause nodes park the
//! run in the snapshot store; terminal nodes complete it; a node with no
//! firing edge dead-ends it. Every decision and outcome lands in the
//! recorder, in order.
//!
//! Edge selection is deterministic: candidates are partitioned by condition
//! match against the just-observed outcome (`conditional` predicates run
//! against the post-merge plane), sorted by priority descending — forward
//! edges first, then feedback — with ties broken by edge id.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::errors::ErrorKind;
use crate::executors::{NodeError, NodeExecutors, NodeOutcome, ResumeState, Suspension};
use crate::graph::{Edge, EdgeCondition, Graph, RESUME_INPUT_KEY};
use crate::llm::TokenUsage;
use crate::memory::{MemoryPlane, VisitCounter};
use crate::recorder::{DecisionOption, Recorder, Severity};
use crate::snapshot::{RunSnapshot, SnapshotStore};

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Suspended => write!(f, "suspended"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal classification of a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub narrative: String,
}

/// What a drive of the scheduler produced.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    /// Node the run stopped at: the terminal node, the pause node, or the
    /// node that failed.
    pub current_node: Option<String>,
    /// Terminal node outputs on completion; the pending payload when
    /// suspended; null otherwise.
    pub output: Value,
    pub failure: Option<RunFailure>,
}

/// Cooperative cancellation flag, honored at the next safe point: the
/// currently-running node finishes, no new node is scheduled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run-scope limits.
#[derive(Clone, Copy, Debug)]
pub struct RunLimits {
    pub run_deadline: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            run_deadline: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Observed {
    Success,
    Failure,
}

/// One run's scheduler. Holds the graph, the executors, the recorder, and
/// the snapshot store; owns the memory plane and visit counter while
/// driving.
pub struct Scheduler {
    graph: Arc<Graph>,
    executors: Arc<NodeExecutors>,
    recorder: Recorder,
    snapshots: Arc<SnapshotStore>,
    limits: RunLimits,
    cancel: CancelToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        graph: Arc<Graph>,
        executors: Arc<NodeExecutors>,
        recorder: Recorder,
        snapshots: Arc<SnapshotStore>,
        limits: RunLimits,
        cancel: CancelToken,
    ) -> Self {
        Self {
            graph,
            executors,
            recorder,
            snapshots,
            limits,
            cancel,
        }
    }

    /// Start a fresh run from the named entry point.
    #[tracing::instrument(skip_all, fields(run_id = %self.recorder.run_id(), %entry))]
    pub async fn start(&self, entry: &str, payload: FxHashMap<String, Value>) -> RunReport {
        self.recorder.run_started(
            self.graph.goal.name.clone(),
            Value::Object(payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );

        let Some(start_node) = self.graph.entry_point(entry) else {
            return self.fail(
                None,
                ErrorKind::Validation,
                format!("graph has no entry point named `{entry}`"),
            );
        };
        let start_node = start_node.to_string();

        let decision_id = self.recorder.record_decision(
            start_node.clone(),
            "enter graph",
            vec![DecisionOption {
                id: entry.to_string(),
                description: format!("begin at `{start_node}`"),
                kind: "entry-point".to_string(),
                pros: vec![],
                cons: vec![],
            }],
            entry,
            format!("caller selected entry point `{entry}`"),
        );

        let memory = MemoryPlane::from_payload(payload);
        self.drive(memory, VisitCounter::default(), start_node, None, decision_id)
            .await
    }

    /// Continue a suspended run with the user's reply.
    ///
    /// The resume entry point `<pause-node>_resume` decides where execution
    /// picks up: a different node advances forward with the reply injected
    /// under `input`; the pause node itself continues its parked transcript.
    #[tracing::instrument(skip_all, fields(run_id = %snapshot.run_id))]
    pub async fn resume(&self, snapshot: RunSnapshot, input: Value) -> RunReport {
        let entry_name = format!("{}_resume", snapshot.pause_node);
        let Some(target) = self.graph.entry_point(&entry_name) else {
            return self.fail(
                Some(snapshot.pause_node.clone()),
                ErrorKind::Validation,
                format!("graph has no resume entry point `{entry_name}`"),
            );
        };
        let target = target.to_string();

        let mut memory = MemoryPlane::from_payload(snapshot.memory);
        let visits = VisitCounter::from_counts(snapshot.visits);

        let resume_state = if target == snapshot.pause_node {
            match snapshot.transcript {
                Some(transcript) => Some(ResumeState {
                    transcript,
                    buffered: snapshot.buffered,
                    reply: reply_text(&input),
                }),
                None => {
                    inject_resume_input(&mut memory, input.clone());
                    None
                }
            }
        } else {
            inject_resume_input(&mut memory, input.clone());
            None
        };

        let decision_id = self.recorder.record_decision(
            target.clone(),
            "resume run",
            vec![DecisionOption {
                id: entry_name.clone(),
                description: format!("continue at `{target}`"),
                kind: "resume-entry-point".to_string(),
                pros: vec![],
                cons: vec![],
            }],
            entry_name,
            "host supplied the awaited input",
        );

        self.drive(memory, visits, target, resume_state, decision_id)
            .await
    }

    /// The main loop: one iteration per scheduling decision.
    async fn drive(
        &self,
        mut memory: MemoryPlane,
        mut visits: VisitCounter,
        start: String,
        mut resume: Option<ResumeState>,
        mut decision_id: String,
    ) -> RunReport {
        let deadline = Instant::now() + self.limits.run_deadline;
        let mut current = start;

        loop {
            if self.cancel.is_cancelled() {
                return self.fail(
                    Some(current),
                    ErrorKind::Cancelled,
                    "run cancelled by host",
                );
            }
            if Instant::now() >= deadline {
                return self.fail(Some(current), ErrorKind::Timeout, "run deadline expired");
            }

            let Some(node) = self.graph.node(&current).cloned() else {
                return self.fail(
                    Some(current.clone()),
                    ErrorKind::Validation,
                    format!("scheduled node `{current}` is not in the graph"),
                );
            };

            // Visit cap: a capped node is a dead end; on-failure edges may
            // still cover it.
            if !visits.allows(&node) {
                self.recorder.record_problem(
                    Severity::Error,
                    Some(current.clone()),
                    format!(
                        "node `{}` reached its visit cap of {}",
                        node.id, node.max_visits
                    ),
                    Some("raise max_visits or adjust the feedback predicate".to_string()),
                    Some(ErrorKind::VisitCapExceeded),
                );
                self.recorder.record_outcome(
                    decision_id.clone(),
                    false,
                    json!({ "kind": ErrorKind::VisitCapExceeded.as_str() }),
                    "visit cap reached before execution",
                    0,
                    TokenUsage::default(),
                );
                match self.select_edge(&current, Observed::Failure, &memory) {
                    Some(edge) => {
                        decision_id = self.record_edge_decision(&current, edge, "visit cap reached");
                        current = edge.to.clone();
                        resume = None;
                        continue;
                    }
                    None => {
                        return self.fail(
                            Some(current),
                            ErrorKind::VisitCapExceeded,
                            format!("node `{}` exceeded its visit cap", node.id),
                        );
                    }
                }
            }

            // Input precondition.
            if let Some(missing) = node.required_inputs().find(|k| !memory.contains(k)) {
                return self.fail(
                    Some(current),
                    ErrorKind::MissingInput,
                    format!(
                        "node `{}` scheduled without required input `{missing}`",
                        node.id
                    ),
                );
            }

            let view = memory.view();
            let started = Instant::now();
            let outcome = self
                .executors
                .execute(&node, &view, resume.take(), &self.recorder)
                .await;
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                NodeOutcome::Success(success) => {
                    let committed = Value::Object(
                        success
                            .output
                            .as_map()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    );
                    if let Err(memory_error) = memory.merge(&node, success.output) {
                        let error = NodeError::Memory(memory_error);
                        match self
                            .after_failure(&current, &error, latency_ms, success.tokens, &memory, &decision_id)
                        {
                            Next::Continue(next, id) => {
                                decision_id = id;
                                current = next;
                                continue;
                            }
                            Next::Fail(report) => return report,
                        }
                    }
                    visits.increment(&current);
                    self.recorder.record_outcome(
                        decision_id.clone(),
                        true,
                        committed,
                        format!("node `{}` completed", node.id),
                        latency_ms,
                        success.tokens,
                    );

                    if self.graph.is_terminal(&current) {
                        let outputs = terminal_outputs(&node.output_keys, &memory);
                        self.recorder.run_ended(
                            true,
                            format!("run completed at `{}`", node.id),
                            outputs.clone(),
                        );
                        return RunReport {
                            run_id: self.recorder.run_id().to_string(),
                            state: RunState::Completed,
                            current_node: Some(current),
                            output: outputs,
                            failure: None,
                        };
                    }

                    // A completed pause node parks the run at the graph
                    // boundary. Client-facing nodes are exempt: their
                    // suspensions happen inside the event loop, and
                    // completion means the conversation is over.
                    if self.graph.is_pause(&current) && !node.client_facing {
                        let pending = terminal_outputs(&node.output_keys, &memory);
                        return self
                            .suspend(&current, &memory, &visits, pending, None, FxHashMap::default())
                            .await;
                    }

                    match self.select_edge(&current, Observed::Success, &memory) {
                        Some(edge) => {
                            decision_id =
                                self.record_edge_decision(&current, edge, "node succeeded");
                            current = edge.to.clone();
                        }
                        None => {
                            return self.fail(
                                Some(current.clone()),
                                ErrorKind::DeadEnd,
                                format!("no outgoing edge fired from `{current}`"),
                            );
                        }
                    }
                }

                NodeOutcome::Failure(error) => {
                    match self.after_failure(
                        &current,
                        &error,
                        latency_ms,
                        TokenUsage::default(),
                        &memory,
                        &decision_id,
                    ) {
                        Next::Continue(next, id) => {
                            decision_id = id;
                            current = next;
                        }
                        Next::Fail(report) => return report,
                    }
                }

                NodeOutcome::Suspend(suspension) => {
                    let Suspension {
                        message,
                        transcript,
                        buffered,
                        tokens,
                    } = suspension;
                    self.recorder.record_outcome(
                        decision_id.clone(),
                        true,
                        json!({ "message": message }),
                        "suspended awaiting human input",
                        latency_ms,
                        tokens,
                    );
                    return self
                        .suspend(
                            &current,
                            &memory,
                            &visits,
                            Value::String(message),
                            Some(transcript),
                            buffered,
                        )
                        .await;
                }
            }
        }
    }

    /// Record the failure, then route via `on-failure`/`always` edges or
    /// terminate the run with the failure's kind.
    fn after_failure(
        &self,
        current: &str,
        error: &NodeError,
        latency_ms: u64,
        tokens: TokenUsage,
        memory: &MemoryPlane,
        decision_id: &str,
    ) -> Next {
        let kind = error.kind();
        self.recorder.record_problem(
            Severity::Error,
            Some(current.to_string()),
            error.to_string(),
            None,
            Some(kind),
        );
        self.recorder.record_outcome(
            decision_id.to_string(),
            false,
            json!({ "kind": kind.as_str(), "message": error.to_string() }),
            format!("node `{current}` failed"),
            latency_ms,
            tokens,
        );
        match self.select_edge(current, Observed::Failure, memory) {
            Some(edge) => {
                let id = self.record_edge_decision(current, edge, "node failed");
                Next::Continue(edge.to.clone(), id)
            }
            None => Next::Fail(self.fail(Some(current.to_string()), kind, error.to_string())),
        }
    }

    /// Pick the first outgoing edge whose condition fires, in evaluation
    /// order. Predicate evaluation errors are recorded and treated as
    /// non-firing.
    fn select_edge(&self, from: &str, observed: Observed, memory: &MemoryPlane) -> Option<&Edge> {
        for edge in self.graph.edges_from(from) {
            let fires = match edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => observed == Observed::Success,
                EdgeCondition::OnFailure => observed == Observed::Failure,
                EdgeCondition::Conditional => {
                    if observed != Observed::Success {
                        false
                    } else {
                        self.eval_edge_predicate(edge, memory)
                    }
                }
            };
            if fires {
                return Some(edge);
            }
        }
        None
    }

    fn eval_edge_predicate(&self, edge: &Edge, memory: &MemoryPlane) -> bool {
        let Some(source) = edge.predicate.as_deref() else {
            return false;
        };
        let parsed = match crate::predicate::Predicate::parse(source) {
            Ok(parsed) => parsed,
            // Unreachable for a validated graph.
            Err(error) => {
                tracing::error!(edge = %edge.id, %error, "edge predicate failed to parse");
                return false;
            }
        };
        match parsed.eval(memory.values()) {
            Ok(fires) => fires,
            Err(error) => {
                self.recorder.record_problem(
                    Severity::Warning,
                    None,
                    format!("predicate on edge `{}` failed to evaluate: {error}", edge.id),
                    Some("check the types the producing node writes".to_string()),
                    None,
                );
                false
            }
        }
    }

    /// Record the commitment to `chosen` among every outgoing edge of `from`.
    fn record_edge_decision(&self, from: &str, chosen: &Edge, why: &str) -> String {
        let options = self
            .graph
            .edges_from(from)
            .into_iter()
            .map(|edge| DecisionOption {
                id: edge.id.clone(),
                description: format!("to `{}` ({}, priority {})", edge.to, edge.condition, edge.priority),
                kind: edge.condition.to_string(),
                pros: if edge.id == chosen.id {
                    vec!["condition fired first in evaluation order".to_string()]
                } else {
                    vec![]
                },
                cons: vec![],
            })
            .collect();
        self.recorder.record_decision(
            from.to_string(),
            format!("route from `{from}`"),
            options,
            chosen.id.clone(),
            format!(
                "{why}; edge `{}` ({}, priority {}) fired",
                chosen.id, chosen.condition, chosen.priority
            ),
        )
    }

    async fn suspend(
        &self,
        current: &str,
        memory: &MemoryPlane,
        visits: &VisitCounter,
        pending: Value,
        transcript: Option<Vec<crate::llm::ChatMessage>>,
        buffered: FxHashMap<String, Value>,
    ) -> RunReport {
        let snapshot = RunSnapshot {
            run_id: self.recorder.run_id().to_string(),
            graph_id: self.graph.header.id.clone(),
            pause_node: current.to_string(),
            memory: memory.export(),
            visits: visits.export(),
            pending: pending.clone(),
            transcript,
            buffered,
            next_seq: self.recorder.next_seq(),
            created_at: chrono::Utc::now(),
        };
        if let Err(error) = self.snapshots.save(&snapshot).await {
            return self.fail(
                Some(current.to_string()),
                ErrorKind::NodeFailure,
                format!("failed to persist run snapshot: {error}"),
            );
        }
        tracing::info!(run_id = %self.recorder.run_id(), node = %current, "run suspended");
        RunReport {
            run_id: self.recorder.run_id().to_string(),
            state: RunState::Suspended,
            current_node: Some(current.to_string()),
            output: pending,
            failure: None,
        }
    }

    fn fail(&self, node: Option<String>, kind: ErrorKind, narrative: impl Into<String>) -> RunReport {
        let narrative = narrative.into();
        self.recorder.record_problem(
            Severity::Error,
            node.clone(),
            narrative.clone(),
            None,
            Some(kind),
        );
        self.recorder
            .run_ended(false, narrative.clone(), Value::Null);
        RunReport {
            run_id: self.recorder.run_id().to_string(),
            state: RunState::Failed,
            current_node: node,
            output: Value::Null,
            failure: Some(RunFailure { kind, narrative }),
        }
    }
}

enum Next {
    Continue(String, String),
    Fail(RunReport),
}

/// The declared outputs of a node, read back from the post-merge plane.
fn terminal_outputs(keys: &[String], memory: &MemoryPlane) -> Value {
    let object: serde_json::Map<String, Value> = keys
        .iter()
        .filter_map(|k| memory.read(k).map(|v| (k.clone(), v.clone())))
        .collect();
    Value::Object(object)
}

/// The reply text appended to a parked transcript on resume.
fn reply_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get(RESUME_INPUT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| input.to_string()),
        other => other.to_string(),
    }
}

/// Merge the resume input into the memory plane: objects merge key-by-key,
/// anything else lands under the conventional `input` key.
fn inject_resume_input(memory: &mut MemoryPlane, input: Value) {
    match input {
        Value::Object(map) => {
            for (k, v) in map {
                memory.write(k, v);
            }
        }
        other => memory.write(RESUME_INPUT_KEY, other),
    }
}
