//! The sidecar document describing tool servers.
//!
//! Loaded at runtime start; an absent file means no external tools. Each
//! entry names a server and its transport:
//!
//! ```json
//! {
//!   "servers": [
//!     {
//!       "name": "search",
//!       "transport": "stdio",
//!       "command": "search-server",
//!       "args": ["--quiet"]
//!     },
//!     { "name": "web", "transport": "http", "url": "https://tools.example/rpc" }
//!   ]
//! }
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::BrokerError;

/// Transport-specific connection parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportSpec {
    /// Child process with line-framed standard streams.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
        env: FxHashMap<String, String>,
    },
    /// HTTP endpoint taking one frame per POST.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
        headers: FxHashMap<String, String>,
    },
}

/// One tool server entry: a unique name plus its transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
}

impl ToolServerDescriptor {
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportSpec::Stdio {
                command: command.into(),
                args,
                working_dir: None,
                env: FxHashMap::default(),
            },
        }
    }

    #[must_use]
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportSpec::Http {
                url: url.into(),
                headers: FxHashMap::default(),
            },
        }
    }
}

/// The whole sidecar document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default)]
    pub servers: Vec<ToolServerDescriptor>,
}

/// Load the sidecar document. A missing file yields the empty configuration.
pub fn load(path: impl AsRef<Path>) -> Result<ToolServerConfig, BrokerError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ToolServerConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| BrokerError::Config {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    serde_json::from_str(&text).map_err(|e| BrokerError::Config {
        message: format!("cannot parse {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_both_transports() {
        let config = ToolServerConfig {
            servers: vec![
                ToolServerDescriptor::stdio("search", "search-server", vec!["--quiet".into()]),
                ToolServerDescriptor::http("web", "https://tools.example/rpc"),
            ],
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: ToolServerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn missing_file_is_empty() {
        let config = load("/nonexistent/tool-servers.json").unwrap();
        assert!(config.servers.is_empty());
    }
}
