//! Runtime configuration: deadlines, loop caps, and the state directory.

use std::path::PathBuf;
use std::time::Duration;

use crate::executors::ExecutorLimits;
use crate::scheduler::RunLimits;

/// Knobs for one [`Runtime`](super::Runtime).
///
/// `Default` resolves the state directory from the environment
/// (`HIVEGRAPH_STATE_DIR`, `.env` honoured) so deployments can relocate run
/// snapshots without code changes.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Root of the per-run snapshot directories.
    pub state_dir: PathBuf,
    /// Deadline for one tool invocation.
    pub tool_call_timeout: Duration,
    /// Deadline for one LLM call.
    pub llm_turn_timeout: Duration,
    /// Deadline for a whole run (suspensions excluded; the clock restarts on
    /// resume).
    pub run_deadline: Duration,
    /// Turn cap of the llm-tools event loop, per node invocation.
    pub max_loop_turns: u32,
    /// Token cap of the llm-tools event loop, per node invocation.
    pub max_loop_tokens: u64,
    /// Also print recorded events to stdout when no sink is configured.
    pub stdout_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::resolve_state_dir(None),
            tool_call_timeout: Duration::from_secs(30),
            llm_turn_timeout: Duration::from_secs(60),
            run_deadline: Duration::from_secs(300),
            max_loop_turns: 16,
            max_loop_tokens: 64_000,
            stdout_events: true,
        }
    }
}

impl RuntimeConfig {
    fn resolve_state_dir(provided: Option<PathBuf>) -> PathBuf {
        if let Some(dir) = provided {
            return dir;
        }
        dotenvy::dotenv().ok();
        std::env::var("HIVEGRAPH_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".hivegraph/runs"))
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Self::resolve_state_dir(Some(dir.into()));
        self
    }

    #[must_use]
    pub fn with_tool_call_timeout(mut self, timeout: Duration) -> Self {
        self.tool_call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_llm_turn_timeout(mut self, timeout: Duration) -> Self {
        self.llm_turn_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_loop_caps(mut self, max_turns: u32, max_tokens: u64) -> Self {
        self.max_loop_turns = max_turns;
        self.max_loop_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn without_stdout_events(mut self) -> Self {
        self.stdout_events = false;
        self
    }

    pub(crate) fn executor_limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            llm_turn_timeout: self.llm_turn_timeout,
            max_loop_turns: self.max_loop_turns,
            max_loop_tokens: self.max_loop_tokens,
        }
    }

    pub(crate) fn run_limits(&self) -> RunLimits {
        RunLimits {
            run_deadline: self.run_deadline,
        }
    }
}
