//! Event sinks for the decision recorder.
//!
//! Sinks receive every recorded event in order. The stdout sink prints one
//! JSON line per event; the memory sink retains events for post-hoc
//! inspection; the channel sink forwards to a `flume` channel so a host can
//! stream the trace elsewhere (a UI, a log shipper, the analytics store).

use std::sync::Mutex;

use miette::Diagnostic;
use thiserror::Error;

use super::RecordedEvent;

#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("event sink disconnected")]
    #[diagnostic(code(hivegraph::recorder::sink_disconnected))]
    Disconnected,
}

/// Receives recorded events. Implementations must tolerate being called from
/// multiple runs concurrently; events of one run always arrive in order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RecordedEvent) -> Result<(), SinkError>;
}

/// Prints each event as one compact JSON line.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, event: &RecordedEvent) -> Result<(), SinkError> {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(error) => tracing::warn!(%error, "failed to serialize recorded event"),
        }
        Ok(())
    }
}

/// Retains every event in memory; the test suite's window into a run.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &RecordedEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError::Disconnected)?
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events into a `flume` channel.
pub struct ChannelSink {
    sender: flume::Sender<RecordedEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(sender: flume::Sender<RecordedEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &RecordedEvent) -> Result<(), SinkError> {
        self.sender
            .send(event.clone())
            .map_err(|_| SinkError::Disconnected)
    }
}
