//! Transports to externally-hosted tool servers.
//!
//! Two transports are supported: a child process speaking line-framed JSON
//! over its standard streams, and an HTTP endpoint taking one frame per POST.
//! Both speak the same four-operation protocol (`handshake`, `list_tools`,
//! `invoke`, `shutdown`) with correlation ids on every frame, so replies can
//! arrive out of order and abandoned calls are simply discarded on lookup
//! miss.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

/// Protocol operation tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOp {
    Handshake,
    ListTools,
    Invoke,
    Shutdown,
}

/// One request frame. `tool` and `args` are present only for `invoke`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub op: FrameOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl RequestFrame {
    #[must_use]
    pub fn handshake(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: FrameOp::Handshake,
            tool: None,
            args: None,
        }
    }

    #[must_use]
    pub fn list_tools(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: FrameOp::ListTools,
            tool: None,
            args: None,
        }
    }

    #[must_use]
    pub fn invoke(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            op: FrameOp::Invoke,
            tool: Some(tool.into()),
            args: Some(args),
        }
    }

    #[must_use]
    pub fn shutdown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: FrameOp::Shutdown,
            tool: None,
            args: None,
        }
    }
}

/// Structured error object a tool server may return in place of a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One reply frame: a result or an error, echoing the request id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

/// Transport-level failure. Distinct from a tool's structured error, which
/// travels inside a [`ReplyFrame`].
#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("failed to spawn tool server process: {message}")]
    #[diagnostic(code(hivegraph::transport::spawn))]
    Spawn { message: String },

    #[error("tool server transport lost: {message}")]
    #[diagnostic(
        code(hivegraph::transport::lost),
        help("the broker attempts one reconnect before surfacing this to the node")
    )]
    Lost { message: String },

    #[error("tool server handshake failed: {message}")]
    #[diagnostic(code(hivegraph::transport::handshake))]
    Handshake { message: String },

    #[error("reply id `{got}` does not match request id `{expected}`")]
    #[diagnostic(code(hivegraph::transport::correlation))]
    CorrelationMismatch { expected: String, got: String },

    #[error("malformed frame: {0}")]
    #[diagnostic(code(hivegraph::transport::frame))]
    Frame(#[from] serde_json::Error),

    #[error("http transport error: {message}")]
    #[diagnostic(code(hivegraph::transport::http))]
    Http { message: String },
}

/// A connection to one tool server.
///
/// `request` resolves when the reply with the matching correlation id
/// arrives; deadlines are the caller's concern. Implementations must survive
/// concurrent callers.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Open the connection and verify the server answers.
    async fn handshake(&self) -> Result<(), TransportError>;

    /// Send one frame and await its correlated reply.
    async fn request(&self, frame: RequestFrame) -> Result<ReplyFrame, TransportError>;

    /// Tear down and re-establish the connection after a loss.
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Best-effort shutdown notification and connection close.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

type PendingMap = Arc<StdMutex<FxHashMap<String, oneshot::Sender<ReplyFrame>>>>;

struct StdioConnection {
    child: Child,
    stdin: ChildStdin,
    reader: tokio::task::JoinHandle<()>,
}

/// Child-process transport with line-framed JSON streams.
///
/// Invocations are serialized per connection: only one frame is in flight at
/// a time, though the reader still routes by correlation id so a stale reply
/// from before a reconnect is discarded rather than mistaken for the current
/// one.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: FxHashMap<String, String>,
    connection: Mutex<Option<StdioConnection>>,
    pending: PendingMap,
    /// One in-flight frame at a time on a stdio pipe.
    turnstile: Mutex<()>,
}

impl StdioTransport {
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
        env: FxHashMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir,
            env,
            connection: Mutex::new(None),
            pending: Arc::new(StdMutex::new(FxHashMap::default())),
            turnstile: Mutex::new(()),
        }
    }

    fn spawn_connection(&self) -> Result<StdioConnection, TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            message: e.to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            message: "child stdout unavailable".to_string(),
        })?;

        let pending = Arc::clone(&self.pending);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ReplyFrame>(&line) {
                    Ok(reply) => {
                        let waiter = pending
                            .lock()
                            .ok()
                            .and_then(|mut map| map.remove(&reply.id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            // Correlation-id miss: the call was abandoned.
                            None => {
                                tracing::debug!(id = %reply.id, "discarding uncorrelated reply")
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "tool server emitted an unparseable line");
                    }
                }
            }
        });

        Ok(StdioConnection {
            child,
            stdin,
            reader,
        })
    }

    async fn teardown(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(mut conn) = slot.take() {
            conn.reader.abort();
            let _ = conn.child.start_kill();
        }
        // Wake every in-flight waiter with a loss.
        if let Ok(mut map) = self.pending.lock() {
            map.clear();
        }
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn handshake(&self) -> Result<(), TransportError> {
        tracing::debug!(command = %self.command, "handshaking stdio tool server");
        {
            let mut slot = self.connection.lock().await;
            if slot.is_none() {
                *slot = Some(self.spawn_connection()?);
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        let reply = self.request(RequestFrame::handshake(id)).await?;
        if let Some(error) = reply.error {
            return Err(TransportError::Handshake {
                message: error.message,
            });
        }
        Ok(())
    }

    async fn request(&self, frame: RequestFrame) -> Result<ReplyFrame, TransportError> {
        let _turn = self.turnstile.lock().await;

        let (tx, rx) = oneshot::channel();
        let id = frame.id.clone();
        if let Ok(mut map) = self.pending.lock() {
            map.insert(id.clone(), tx);
        }

        let line = serde_json::to_string(&frame)?;
        {
            let mut slot = self.connection.lock().await;
            let conn = slot.as_mut().ok_or_else(|| TransportError::Lost {
                message: "not connected".to_string(),
            })?;
            let write = async {
                conn.stdin.write_all(line.as_bytes()).await?;
                conn.stdin.write_all(b"\n").await?;
                conn.stdin.flush().await
            };
            if let Err(e) = write.await {
                if let Ok(mut map) = self.pending.lock() {
                    map.remove(&id);
                }
                return Err(TransportError::Lost {
                    message: e.to_string(),
                });
            }
        }

        match rx.await {
            Ok(reply) => {
                if reply.id != id {
                    return Err(TransportError::CorrelationMismatch {
                        expected: id,
                        got: reply.id,
                    });
                }
                Ok(reply)
            }
            Err(_) => Err(TransportError::Lost {
                message: "connection closed before reply".to_string(),
            }),
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        tracing::info!(command = %self.command, "respawning stdio tool server");
        self.teardown().await;
        self.handshake().await
    }

    async fn shutdown(&self) {
        let id = uuid::Uuid::new_v4().to_string();
        let line = serde_json::to_string(&RequestFrame::shutdown(id)).unwrap_or_default();
        {
            let mut slot = self.connection.lock().await;
            if let Some(conn) = slot.as_mut() {
                let _ = conn.stdin.write_all(line.as_bytes()).await;
                let _ = conn.stdin.write_all(b"\n").await;
                let _ = conn.stdin.flush().await;
            }
        }
        self.teardown().await;
    }
}

// ---------------------------------------------------------------------------
// http
// ---------------------------------------------------------------------------

/// HTTP transport: one frame per POST, reply in the response body.
///
/// Stateless per call, so concurrent invocations are naturally safe and
/// correlation is verified on every response.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        headers: &FxHashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes()).map_err(|e| {
                TransportError::Http {
                    message: format!("invalid header name `{k}`: {e}"),
                }
            })?;
            let value = reqwest::header::HeaderValue::from_str(v).map_err(|e| {
                TransportError::Http {
                    message: format!("invalid header value for `{k}`: {e}"),
                }
            })?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| TransportError::Http {
                message: e.to_string(),
            })?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn handshake(&self) -> Result<(), TransportError> {
        tracing::debug!(url = %self.url, "handshaking http tool server");
        let reply = self
            .request(RequestFrame::handshake(uuid::Uuid::new_v4().to_string()))
            .await?;
        if let Some(error) = reply.error {
            return Err(TransportError::Handshake {
                message: error.message,
            });
        }
        Ok(())
    }

    async fn request(&self, frame: RequestFrame) -> Result<ReplyFrame, TransportError> {
        let id = frame.id.clone();
        let response = self
            .client
            .post(&self.url)
            .json(&frame)
            .send()
            .await
            .map_err(|e| TransportError::Lost {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Http {
                message: format!("server answered {}", response.status()),
            });
        }
        let reply: ReplyFrame = response.json().await.map_err(|e| TransportError::Lost {
            message: e.to_string(),
        })?;
        if reply.id != id {
            return Err(TransportError::CorrelationMismatch {
                expected: id,
                got: reply.id,
            });
        }
        Ok(reply)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        // Nothing to re-open; verify the endpoint still answers.
        self.handshake().await
    }

    async fn shutdown(&self) {
        let id = uuid::Uuid::new_v4().to_string();
        let _ = self.request(RequestFrame::shutdown(id)).await;
    }
}
