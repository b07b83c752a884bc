//! # hivegraph: a runtime for goal-driven agent graphs
//!
//! Hivegraph executes agents specified as directed graphs of nodes. A graph
//! alternates deterministic transformations with LLM-mediated steps that may
//! call external tools; the runtime advances it one node at a time, isolates
//! each node behind a per-run memory plane, brokers tool invocations to
//! remote servers, suspends cooperatively at pause nodes for
//! human-in-the-loop turns, bounds feedback loops with visit caps, and
//! records a structured decision/outcome trace for post-hoc analysis.
//!
//! ## Core Concepts
//!
//! - **Graph**: immutable description of nodes, edges, entry points, and the
//!   pause/terminal sets, headed by the goal it serves ([`graph`])
//! - **Memory plane**: the run's keyed store; nodes read snapshots and
//!   commit buffered writes atomically ([`memory`])
//! - **Scheduler**: the per-run state machine selecting edges by condition
//!   and signed priority ([`scheduler`])
//! - **Executors**: four node variants — function, llm-generate, llm-tools,
//!   router ([`executors`])
//! - **Tool broker**: registry of stdio/HTTP tool servers with correlated
//!   invocation ([`broker`])
//! - **Recorder**: the append-only per-run decision trace ([`recorder`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use hivegraph::runtime::Runtime;
//! use rustc_hash::FxHashMap;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // A graph authored elsewhere, persisted as JSON.
//! let graph = hivegraph::graph::load("plan.graph.json")?;
//!
//! let runtime = Runtime::builder(graph)
//!     .with_function_fn("normalize", |view: &hivegraph::memory::InputView| {
//!         let mut out = FxHashMap::default();
//!         out.insert("clean".to_string(), json!(view.get("raw")));
//!         Ok(out)
//!     })
//!     .build();
//!
//! let mut input = FxHashMap::default();
//! input.insert("raw".to_string(), json!("  hello  "));
//! let report = runtime.run(input).await;
//! assert_eq!(report.state, hivegraph::scheduler::RunState::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! Runs suspend when a pause node completes (or a client-facing node ends a
//! turn); `Runtime::resume` re-enters the graph through the
//! `<pause-node>_resume` entry point with the user's reply.
//!
//! ## Module Guide
//!
//! - [`graph`] - Graph descriptions, loader, and validation
//! - [`memory`] - Memory plane, input views, visit counters
//! - [`predicate`] - The bounded expression sublanguage
//! - [`template`] - `{name}` system-prompt substitution
//! - [`llm`] - Semantic LLM interface (transcripts, tool schemas)
//! - [`executors`] - The four node executors and their outcome contract
//! - [`broker`] - Tool-server registry and transports
//! - [`scheduler`] - The per-run scheduling state machine
//! - [`runtime`] - Host-facing run/resume/status/cancel surface
//! - [`snapshot`] - Per-run suspension snapshots
//! - [`recorder`] - Decision/outcome/problem event stream
//! - [`errors`] - The failure-kind taxonomy
//! - [`telemetry`] - Tracing bootstrap

pub mod broker;
pub mod errors;
pub mod executors;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod predicate;
pub mod recorder;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod template;
