//! The tool broker: registry, catalogue, and invocation dispatch.
//!
//! The broker owns every registered tool server, caches each server's tool
//! catalogue at registration, and routes invocations to the owning server by
//! tool name. On a name collision the first-registered server wins and the
//! collision is reported, never silently shadowed. A structured tool error is
//! returned to the caller as data — the LLM observes it and reacts — while
//! transport losses get one reconnect attempt before they fail the call.

pub mod config;
pub mod transport;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::llm::ToolSchema;

pub use config::{ToolServerConfig, ToolServerDescriptor, TransportSpec};
pub use transport::{
    FrameOp, HttpTransport, ReplyFrame, RequestFrame, StdioTransport, ToolErrorBody,
    ToolTransport, TransportError,
};

/// Broker-level failure.
#[derive(Debug, Error, Diagnostic)]
pub enum BrokerError {
    #[error("tool server `{name}` is already registered")]
    #[diagnostic(code(hivegraph::broker::duplicate_server))]
    DuplicateServer { name: String },

    #[error("no registered server is named `{name}`")]
    #[diagnostic(code(hivegraph::broker::unknown_server))]
    UnknownServer { name: String },

    #[error("no registered server exposes tool `{name}`")]
    #[diagnostic(code(hivegraph::broker::unknown_tool))]
    UnknownTool { name: String },

    #[error("failed to connect to tool server `{server}`: {source}")]
    #[diagnostic(code(hivegraph::broker::connect))]
    Connect {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("transport to tool server `{server}` lost: {source}")]
    #[diagnostic(code(hivegraph::broker::transport_lost))]
    TransportLost {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("tool call `{tool}` exceeded its deadline")]
    #[diagnostic(code(hivegraph::broker::timeout))]
    Timeout { tool: String },

    #[error("tool server catalogue is malformed: {message}")]
    #[diagnostic(code(hivegraph::broker::catalogue))]
    Catalogue { message: String },

    #[error("tool server configuration error: {message}")]
    #[diagnostic(code(hivegraph::broker::config))]
    Config { message: String },
}

/// What a successful `invoke` hands back: the server's result, or the
/// server's structured error. Both are data from the node's point of view.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolReply {
    Result(Value),
    Error(ToolErrorBody),
}

impl ToolReply {
    /// Serialize for appending to an LLM transcript.
    #[must_use]
    pub fn to_transcript_json(&self) -> Value {
        match self {
            ToolReply::Result(value) => serde_json::json!({ "result": value }),
            ToolReply::Error(body) => serde_json::json!({
                "error": { "message": body.message, "code": body.code, "data": body.data }
            }),
        }
    }
}

/// Outcome of registering one server.
#[derive(Clone, Debug)]
pub struct Registration {
    pub server: String,
    pub tools: Vec<ToolSchema>,
    /// Tool names already owned by an earlier registration; calls to these
    /// keep going to the first owner.
    pub shadowed: Vec<String>,
}

struct RegisteredServer {
    name: String,
    descriptor: Option<ToolServerDescriptor>,
    transport: Arc<dyn ToolTransport>,
    tools: Vec<ToolSchema>,
}

/// Registry of tool servers shared by every run in the process.
///
/// Registration order matters: the first server to claim a tool name owns it
/// for dispatch.
pub struct ToolBroker {
    servers: RwLock<Vec<RegisteredServer>>,
    call_timeout: Duration,
}

impl ToolBroker {
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            call_timeout,
        }
    }

    /// Register a server from its descriptor: open the transport, handshake,
    /// fetch and cache the catalogue. Connection failure is fatal for
    /// registration.
    #[tracing::instrument(skip(self, descriptor), fields(server = %descriptor.name))]
    pub async fn register(
        &self,
        descriptor: ToolServerDescriptor,
    ) -> Result<Registration, BrokerError> {
        let transport: Arc<dyn ToolTransport> = match &descriptor.transport {
            TransportSpec::Stdio {
                command,
                args,
                working_dir,
                env,
            } => Arc::new(StdioTransport::new(
                command.clone(),
                args.clone(),
                working_dir.clone(),
                env.clone(),
            )),
            TransportSpec::Http { url, headers } => Arc::new(
                HttpTransport::new(url.clone(), headers).map_err(|source| BrokerError::Connect {
                    server: descriptor.name.clone(),
                    source,
                })?,
            ),
        };
        let name = descriptor.name.clone();
        self.register_inner(name, Some(descriptor), transport).await
    }

    /// Register a server over a caller-supplied transport. Used by embedders
    /// and test harnesses that host tools in-process.
    pub async fn register_with_transport(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn ToolTransport>,
    ) -> Result<Registration, BrokerError> {
        self.register_inner(name.into(), None, transport).await
    }

    async fn register_inner(
        &self,
        name: String,
        descriptor: Option<ToolServerDescriptor>,
        transport: Arc<dyn ToolTransport>,
    ) -> Result<Registration, BrokerError> {
        {
            let servers = self.servers.read().await;
            if servers.iter().any(|s| s.name == name) {
                return Err(BrokerError::DuplicateServer { name });
            }
        }

        transport
            .handshake()
            .await
            .map_err(|source| BrokerError::Connect {
                server: name.clone(),
                source,
            })?;

        let reply = transport
            .request(RequestFrame::list_tools(uuid::Uuid::new_v4().to_string()))
            .await
            .map_err(|source| BrokerError::Connect {
                server: name.clone(),
                source,
            })?;
        let tools = parse_catalogue(reply)?;

        let mut servers = self.servers.write().await;
        let shadowed: Vec<String> = tools
            .iter()
            .filter(|t| {
                servers
                    .iter()
                    .any(|s| s.tools.iter().any(|owned| owned.name == t.name))
            })
            .map(|t| t.name.clone())
            .collect();
        for tool in &shadowed {
            tracing::warn!(server = %name, %tool, "tool name collision; first registration wins");
        }
        servers.push(RegisteredServer {
            name: name.clone(),
            descriptor,
            tools: tools.clone(),
            transport,
        });
        tracing::info!(server = %name, tools = tools.len(), "tool server registered");
        Ok(Registration {
            server: name,
            tools,
            shadowed,
        })
    }

    /// Close the transport and drop the server's catalogue entries.
    pub async fn unregister(&self, name: &str) -> Result<(), BrokerError> {
        let removed = {
            let mut servers = self.servers.write().await;
            let at = servers.iter().position(|s| s.name == name);
            at.map(|i| servers.remove(i))
        };
        match removed {
            Some(server) => {
                server.transport.shutdown().await;
                Ok(())
            }
            None => Err(BrokerError::UnknownServer {
                name: name.to_string(),
            }),
        }
    }

    /// The cached catalogue: one server's, or every server's.
    pub async fn list_tools(&self, server: Option<&str>) -> Result<Vec<ToolSchema>, BrokerError> {
        let servers = self.servers.read().await;
        match server {
            Some(name) => servers
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.tools.clone())
                .ok_or_else(|| BrokerError::UnknownServer {
                    name: name.to_string(),
                }),
            None => Ok(servers.iter().flat_map(|s| s.tools.iter().cloned()).collect()),
        }
    }

    /// Schemas for a node's permitted tool set, in catalogue order. Names
    /// with no registered owner are skipped; the executor reports them when
    /// the model actually calls one.
    pub async fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        let servers = self.servers.read().await;
        let mut out = Vec::new();
        for name in names {
            let owned = servers
                .iter()
                .flat_map(|s| s.tools.iter())
                .find(|t| &t.name == name);
            if let Some(schema) = owned {
                if !out.iter().any(|s: &ToolSchema| s.name == schema.name) {
                    out.push(schema.clone());
                }
            }
        }
        out
    }

    /// Dispatch one invocation to the server owning `tool`, blocking until
    /// the correlated reply arrives or the per-call deadline expires.
    ///
    /// A transport loss is retried once after a reconnect.
    #[tracing::instrument(skip(self, args), fields(%tool, %correlation_id))]
    pub async fn invoke(
        &self,
        tool: &str,
        args: Value,
        correlation_id: &str,
    ) -> Result<ToolReply, BrokerError> {
        let (server_name, transport) = {
            let servers = self.servers.read().await;
            let owner = servers
                .iter()
                .find(|s| s.tools.iter().any(|t| t.name == tool))
                .ok_or_else(|| BrokerError::UnknownTool {
                    name: tool.to_string(),
                })?;
            (owner.name.clone(), Arc::clone(&owner.transport))
        };

        let frame = RequestFrame::invoke(correlation_id, tool, args);
        let first = tokio::time::timeout(self.call_timeout, transport.request(frame.clone())).await;
        let reply = match first {
            Err(_) => {
                return Err(BrokerError::Timeout {
                    tool: tool.to_string(),
                });
            }
            Ok(Ok(reply)) => reply,
            Ok(Err(TransportError::Lost { .. })) => {
                tracing::warn!(server = %server_name, "transport lost mid-call; reconnecting once");
                transport
                    .reconnect()
                    .await
                    .map_err(|source| BrokerError::TransportLost {
                        server: server_name.clone(),
                        source,
                    })?;
                let retry =
                    tokio::time::timeout(self.call_timeout, transport.request(frame)).await;
                match retry {
                    Err(_) => {
                        return Err(BrokerError::Timeout {
                            tool: tool.to_string(),
                        });
                    }
                    Ok(Ok(reply)) => reply,
                    Ok(Err(source)) => {
                        return Err(BrokerError::TransportLost {
                            server: server_name,
                            source,
                        });
                    }
                }
            }
            Ok(Err(source)) => {
                return Err(BrokerError::TransportLost {
                    server: server_name,
                    source,
                });
            }
        };

        debug_assert_eq!(reply.id, correlation_id);
        match (reply.result, reply.error) {
            (_, Some(error)) => Ok(ToolReply::Error(error)),
            (Some(result), None) => Ok(ToolReply::Result(result)),
            (None, None) => Ok(ToolReply::Result(Value::Null)),
        }
    }

    /// Names of every registered server, in registration order.
    pub async fn server_names(&self) -> Vec<String> {
        self.servers
            .read()
            .await
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// The descriptor a server was registered from, when it came from one.
    pub async fn descriptor(&self, name: &str) -> Option<ToolServerDescriptor> {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.descriptor.clone())
    }
}

fn parse_catalogue(reply: ReplyFrame) -> Result<Vec<ToolSchema>, BrokerError> {
    if let Some(error) = reply.error {
        return Err(BrokerError::Catalogue {
            message: error.message,
        });
    }
    let value = reply.result.unwrap_or(Value::Null);
    let entries = value
        .get("tools")
        .cloned()
        .unwrap_or(value);
    serde_json::from_value::<Vec<ToolSchema>>(entries).map_err(|e| BrokerError::Catalogue {
        message: e.to_string(),
    })
}

/// Map of tool name → owning server, useful for diagnostics.
pub async fn ownership(broker: &ToolBroker) -> FxHashMap<String, String> {
    let mut map = FxHashMap::default();
    for server in broker.server_names().await {
        if let Ok(tools) = broker.list_tools(Some(&server)).await {
            for tool in tools {
                map.entry(tool.name).or_insert_with(|| server.clone());
            }
        }
    }
    map
}
