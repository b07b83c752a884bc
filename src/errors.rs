//! The failure taxonomy shared by run reports and the decision trace.
//!
//! Every failure the runtime can produce maps to exactly one [`ErrorKind`],
//! emitted at one well-defined scope: load-time validation, a memory-plane
//! contract violation, a scheduling dead end, an LLM- or tool-side fault, or
//! a host-initiated cancellation. Node-level kinds surface to the scheduler
//! so `on-failure` edges can cover them; run-level kinds terminate the run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classifies a failure for routing and for the recorded trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The graph description violates a structural invariant. Fatal at load.
    Validation,
    /// A non-nullable declared input key was absent at schedule time.
    MissingInput,
    /// A non-nullable declared output key was absent at commit time.
    MissingRequiredOutput,
    /// A node reached its visit cap and no `on-failure` edge covered it.
    VisitCapExceeded,
    /// No outgoing edge fired from a non-terminal node.
    DeadEnd,
    /// The LLM provider returned an error or unusable response.
    LlmError,
    /// The LLM-tools event loop hit its turn or token cap.
    LoopExhausted,
    /// A tool server returned a structured error. Observed by the LLM, never
    /// a node failure on its own.
    ToolError,
    /// The transport to a tool server dropped mid-call.
    ToolTransportLost,
    /// A per-call, per-turn, or per-run deadline expired.
    Timeout,
    /// The host cancelled the run.
    Cancelled,
    /// A host-provided binding or router raised.
    NodeFailure,
}

impl ErrorKind {
    /// Stable string form used in persisted events (`kebab-case`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::MissingInput => "missing-input",
            ErrorKind::MissingRequiredOutput => "missing-required-output",
            ErrorKind::VisitCapExceeded => "visit-cap-exceeded",
            ErrorKind::DeadEnd => "dead-end",
            ErrorKind::LlmError => "llm-error",
            ErrorKind::LoopExhausted => "loop-exhausted",
            ErrorKind::ToolError => "tool-error",
            ErrorKind::ToolTransportLost => "tool-transport-lost",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NodeFailure => "node-failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
