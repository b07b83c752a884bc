//! The host-facing surface: build a runtime around one graph, then run,
//! resume, inspect, and cancel runs.
//!
//! A [`Runtime`] binds a validated graph to its collaborators — host function
//! bindings, an LLM client, the shared tool broker, event sinks — and keeps a
//! registry of the runs it has driven. Runs execute cooperatively inside
//! `run`/`resume`; `cancel` flips a token another task can set while a run is
//! in flight.
//!
//! ```no_run
//! use hivegraph::runtime::Runtime;
//! use rustc_hash::FxHashMap;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = hivegraph::graph::load("research.graph.json")?;
//! let runtime = Runtime::builder(graph)
//!     .with_function_fn("intake", |view: &hivegraph::memory::InputView| {
//!         let mut out = FxHashMap::default();
//!         out.insert("brief".to_string(), json!(view.get("topic")));
//!         Ok(out)
//!     })
//!     .build();
//!
//! let mut input = FxHashMap::default();
//! input.insert("topic".to_string(), json!("local-first sync"));
//! let report = runtime.run(input).await;
//! println!("{}: {}", report.run_id, report.state);
//! # Ok(())
//! # }
//! ```

mod config;

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};

use crate::broker::{BrokerError, Registration, ToolBroker, ToolServerDescriptor};
use crate::executors::{FunctionError, FunctionRegistry, NodeExecutors, NodeFunction};
use crate::graph::{DEFAULT_ENTRY, Graph};
use crate::llm::LlmClient;
use crate::memory::InputView;
use crate::recorder::{EventSink, Recorder, StdoutSink};
use crate::scheduler::{CancelToken, RunReport, RunState, Scheduler};
use crate::snapshot::{SnapshotError, SnapshotStore};

pub use config::RuntimeConfig;

/// What `status` reports for one run.
#[derive(Clone, Debug)]
pub struct RunStatus {
    pub state: RunState,
    pub current_node: Option<String>,
    /// Last payload the run produced: terminal outputs, or the pending
    /// suspension payload.
    pub last_output: Value,
}

struct RunEntry {
    state: RunState,
    current_node: Option<String>,
    last_output: Value,
    cancel: CancelToken,
}

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    graph: Graph,
    functions: FunctionRegistry,
    llm: Option<Arc<dyn LlmClient>>,
    broker: Option<Arc<ToolBroker>>,
    sinks: Vec<Arc<dyn EventSink>>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Register an async host binding for a function node.
    #[must_use]
    pub fn with_function(
        mut self,
        node_id: impl Into<String>,
        binding: Arc<dyn NodeFunction>,
    ) -> Self {
        self.functions.register(node_id, binding);
        self
    }

    /// Register a synchronous closure as a function-node binding.
    #[must_use]
    pub fn with_function_fn<F>(mut self, node_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&InputView) -> Result<FxHashMap<String, Value>, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.register_fn(node_id, f);
        self
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Share a broker across runtimes instead of creating a private one.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<ToolBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(ToolBroker::new(self.config.tool_call_timeout)));
        let mut sinks = self.sinks;
        if sinks.is_empty() && self.config.stdout_events {
            sinks.push(Arc::new(StdoutSink::new()));
        }
        let executors = Arc::new(NodeExecutors::new(
            self.functions,
            self.llm,
            Arc::clone(&broker),
            self.config.executor_limits(),
        ));
        Runtime {
            graph: Arc::new(self.graph),
            executors,
            broker,
            snapshots: Arc::new(SnapshotStore::new(self.config.state_dir.clone())),
            sinks: Arc::new(sinks),
            config: self.config,
            runs: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }
}

/// One graph bound to its collaborators, ready to drive runs.
#[derive(Clone)]
pub struct Runtime {
    graph: Arc<Graph>,
    executors: Arc<NodeExecutors>,
    broker: Arc<ToolBroker>,
    snapshots: Arc<SnapshotStore>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
    config: RuntimeConfig,
    runs: Arc<RwLock<FxHashMap<String, RunEntry>>>,
}

impl Runtime {
    #[must_use]
    pub fn builder(graph: Graph) -> RuntimeBuilder {
        RuntimeBuilder {
            graph,
            functions: FunctionRegistry::new(),
            llm: None,
            broker: None,
            sinks: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<ToolBroker> {
        &self.broker
    }

    /// Start a run at the default entry point and drive it until it
    /// completes, fails, or suspends.
    pub async fn run(&self, input: FxHashMap<String, Value>) -> RunReport {
        self.run_from(DEFAULT_ENTRY, input).await
    }

    /// Start a run at a named entry point.
    #[tracing::instrument(skip_all, fields(%entry))]
    pub async fn run_from(&self, entry: &str, input: FxHashMap<String, Value>) -> RunReport {
        let recorder = Recorder::new(self.sinks.as_ref().clone());
        let cancel = CancelToken::new();
        self.track(recorder.run_id(), RunState::Running, None, Value::Null, cancel.clone());

        let scheduler = self.scheduler(recorder, cancel);
        let report = scheduler.start(entry, input).await;
        self.absorb(&report).await;
        report
    }

    /// Continue a suspended run with the user's reply.
    ///
    /// Fails fast when no snapshot exists for `run_id`; every in-run failure
    /// is reported through the returned [`RunReport`].
    #[tracing::instrument(skip_all, fields(%run_id))]
    pub async fn resume(&self, run_id: &str, input: Value) -> Result<RunReport, SnapshotError> {
        let snapshot = self.snapshots.load(run_id).await?;
        let recorder = Recorder::with_sequence(
            snapshot.run_id.clone(),
            snapshot.next_seq,
            self.sinks.as_ref().clone(),
        );
        let cancel = CancelToken::new();
        self.track(run_id, RunState::Running, Some(snapshot.pause_node.clone()), Value::Null, cancel.clone());

        let scheduler = self.scheduler(recorder, cancel);
        let report = scheduler.resume(snapshot, input).await;
        self.absorb(&report).await;
        Ok(report)
    }

    /// Current state of a run: live registry first, then the snapshot store
    /// for suspended runs from an earlier process.
    pub async fn status(&self, run_id: &str) -> Option<RunStatus> {
        if let Ok(runs) = self.runs.read() {
            if let Some(entry) = runs.get(run_id) {
                return Some(RunStatus {
                    state: entry.state,
                    current_node: entry.current_node.clone(),
                    last_output: entry.last_output.clone(),
                });
            }
        }
        match self.snapshots.load(run_id).await {
            Ok(snapshot) => Some(RunStatus {
                state: RunState::Suspended,
                current_node: Some(snapshot.pause_node),
                last_output: snapshot.pending,
            }),
            Err(_) => None,
        }
    }

    /// Request cancellation; the run stops at its next safe point.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs.read() {
            Ok(runs) => match runs.get(run_id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Register a tool server for every run driven by this runtime.
    pub async fn register_tool_server(
        &self,
        descriptor: ToolServerDescriptor,
    ) -> Result<Registration, BrokerError> {
        self.broker.register(descriptor).await
    }

    pub async fn unregister_tool_server(&self, name: &str) -> Result<(), BrokerError> {
        self.broker.unregister(name).await
    }

    /// Register every server in a sidecar document (see [`crate::broker::config`]).
    pub async fn load_tool_servers(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<Vec<Registration>, BrokerError> {
        let config = crate::broker::config::load(path)?;
        let mut registrations = Vec::with_capacity(config.servers.len());
        for descriptor in config.servers {
            registrations.push(self.broker.register(descriptor).await?);
        }
        Ok(registrations)
    }

    /// Suspended runs recoverable from the snapshot store.
    pub async fn suspended_runs(&self) -> Result<Vec<String>, SnapshotError> {
        self.snapshots.list().await
    }

    fn scheduler(&self, recorder: Recorder, cancel: CancelToken) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.executors),
            recorder,
            Arc::clone(&self.snapshots),
            self.config.run_limits(),
            cancel,
        )
    }

    fn track(
        &self,
        run_id: &str,
        state: RunState,
        current_node: Option<String>,
        last_output: Value,
        cancel: CancelToken,
    ) {
        if let Ok(mut runs) = self.runs.write() {
            runs.insert(
                run_id.to_string(),
                RunEntry {
                    state,
                    current_node,
                    last_output,
                    cancel,
                },
            );
        }
    }

    async fn absorb(&self, report: &RunReport) {
        if let Ok(mut runs) = self.runs.write() {
            if let Some(entry) = runs.get_mut(&report.run_id) {
                entry.state = report.state;
                entry.current_node = report.current_node.clone();
                entry.last_output = report.output.clone();
            }
        }
        // A finished run no longer needs its snapshot directory.
        if matches!(report.state, RunState::Completed | RunState::Failed) {
            if let Err(error) = self.snapshots.remove(&report.run_id).await {
                tracing::warn!(run_id = %report.run_id, %error, "failed to clean up run snapshot");
            }
        }
    }
}
