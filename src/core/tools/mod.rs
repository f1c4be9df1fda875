pub mod adapter;
pub mod env;
pub mod local;

pub use adapter::{AdapterConnector, ToolAdapter, ToolInfo, ToolResponse};
pub use local::{LocalHandler, LocalTool};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::core::agent::ToolRef;
use crate::core::lifecycle::LifecycleComponent;

/// How to launch one subprocess tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Where a server registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Config,
    Builtin,
    Api,
}

impl fmt::Display for ToolSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolSource::Config => "config",
            ToolSource::Builtin => "builtin",
            ToolSource::Api => "api",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    /// `server.tool`
    pub name: String,
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: Value,
    pub source: ToolSource,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid tool name '{0}': expected '<server>.<tool>'")]
    InvalidName(String),
    #[error("invalid server name '{0}': must be non-empty and contain no '.'")]
    InvalidServerName(String),
    #[error("server '{server}' not found (available servers: {available})")]
    ServerNotFound { server: String, available: String },
    #[error("tool '{tool}' not found on server '{server}' (available tools: {available})")]
    ToolNotFound {
        server: String,
        tool: String,
        available: String,
    },
    #[error("failed to connect server '{server}': {message}")]
    Connect { server: String, message: String },
    #[error("tool '{name}' failed: {message}")]
    Call { name: String, message: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Disconnect and replace an existing server of the same name.
    pub replace: bool,
}

enum ServerBackend {
    Adapter(Arc<dyn ToolAdapter>),
    Local(HashMap<String, LocalHandler>),
}

struct ServerEntry {
    source: ToolSource,
    tools: Vec<RegisteredTool>,
    backend: ServerBackend,
}

impl ServerEntry {
    async fn disconnect(&self, name: &str) {
        if let ServerBackend::Adapter(adapter) = &self.backend
            && let Err(e) = adapter.disconnect().await
        {
            warn!("Failed to disconnect tool server [{}]: {}", name, e);
        }
    }
}

fn join_or_none<I: IntoIterator<Item = String>>(names: I) -> String {
    let mut names: Vec<String> = names.into_iter().collect();
    if names.is_empty() {
        return "none".to_string();
    }
    names.sort();
    names.join(", ")
}

/// Process-wide catalog of tool servers, keyed by server name.
///
/// Each mutation swaps a whole [`ServerEntry`]; calls clone the entry's
/// `Arc` and release the lock before dispatching.
pub struct ToolRegistry {
    servers: RwLock<HashMap<String, Arc<ServerEntry>>>,
    connector: Arc<dyn AdapterConnector>,
}

impl ToolRegistry {
    pub fn new(connector: Arc<dyn AdapterConnector>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            connector,
        }
    }

    pub async fn register_server(
        &self,
        name: &str,
        config: &ServerConfig,
        source: ToolSource,
        options: RegisterOptions,
    ) -> Result<Vec<RegisteredTool>, ToolError> {
        validate_server_name(name)?;

        if options.replace {
            let old = self.servers.write().await.remove(name);
            if let Some(old) = old {
                info!("Replacing tool server [{}]", name);
                old.disconnect(name).await;
            }
        } else if let Some(existing) = self.servers.read().await.get(name) {
            warn!(
                "Tool server [{}] is already registered ({}); keeping existing tools",
                name, existing.source
            );
            return Ok(existing.tools.clone());
        }

        let adapter = self
            .connector
            .connect(name, config)
            .await
            .map_err(|e| ToolError::Connect {
                server: name.to_string(),
                message: e.to_string(),
            })?;
        let infos = match adapter.list_tools().await {
            Ok(infos) => infos,
            Err(e) => {
                let _ = adapter.disconnect().await;
                return Err(ToolError::Connect {
                    server: name.to_string(),
                    message: format!("listing tools failed: {}", e),
                });
            }
        };

        let tools: Vec<RegisteredTool> = infos
            .into_iter()
            .map(|info| RegisteredTool {
                name: format!("{}.{}", name, info.name),
                server: name.to_string(),
                description: info.description.unwrap_or_default(),
                input_schema: info.input_schema,
                tool: info.name,
                source,
            })
            .collect();
        let entry = Arc::new(ServerEntry {
            source,
            tools: tools.clone(),
            backend: ServerBackend::Adapter(adapter.clone()),
        });

        let displaced = {
            let mut servers = self.servers.write().await;
            if !options.replace
                && let Some(existing) = servers.get(name)
            {
                // Lost a race with a concurrent registration of the same name.
                let existing = existing.tools.clone();
                drop(servers);
                let _ = adapter.disconnect().await;
                return Ok(existing);
            }
            servers.insert(name.to_string(), entry)
        };
        if let Some(displaced) = displaced {
            displaced.disconnect(name).await;
        }

        info!(
            "Registered tool server [{}] ({}) with {} tools",
            name,
            source,
            tools.len()
        );
        Ok(tools)
    }

    /// Register in-process handlers. Same duplicate rule as
    /// [`ToolRegistry::register_server`] without `replace`.
    pub async fn register_local_server(
        &self,
        name: &str,
        handlers: Vec<LocalTool>,
        source: ToolSource,
    ) -> Result<Vec<RegisteredTool>, ToolError> {
        validate_server_name(name)?;

        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.get(name) {
            warn!(
                "Tool server [{}] is already registered ({}); keeping existing tools",
                name, existing.source
            );
            return Ok(existing.tools.clone());
        }

        let mut tools = Vec::with_capacity(handlers.len());
        let mut backend = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            tools.push(RegisteredTool {
                name: format!("{}.{}", name, handler.name),
                server: name.to_string(),
                tool: handler.name.clone(),
                description: handler.description,
                input_schema: handler.input_schema,
                source,
            });
            backend.insert(handler.name, handler.handler);
        }

        servers.insert(
            name.to_string(),
            Arc::new(ServerEntry {
                source,
                tools: tools.clone(),
                backend: ServerBackend::Local(backend),
            }),
        );
        info!(
            "Registered local tool server [{}] with {} tools",
            name,
            tools.len()
        );
        Ok(tools)
    }

    pub async fn list_tools(&self) -> Vec<RegisteredTool> {
        self.servers
            .read()
            .await
            .values()
            .flat_map(|entry| entry.tools.iter().cloned())
            .collect()
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Expand an agent's tool references. Unknown references are logged and
    /// skipped; duplicates are dropped.
    pub async fn resolve<'a, I>(&self, refs: I) -> Vec<RegisteredTool>
    where
        I: IntoIterator<Item = ToolRef<'a>>,
    {
        let servers = self.servers.read().await;
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for reference in refs {
            let matching: Vec<&RegisteredTool> = match reference {
                ToolRef::Server(server) => match servers.get(server) {
                    Some(entry) => entry.tools.iter().collect(),
                    None => {
                        warn!("Tool reference '{}' names an unknown server", server);
                        continue;
                    }
                },
                ToolRef::Tool(name) => {
                    let found = name.split_once('.').and_then(|(server, _)| {
                        servers
                            .get(server)
                            .and_then(|e| e.tools.iter().find(|t| t.name == name))
                    });
                    match found {
                        Some(tool) => vec![tool],
                        None => {
                            warn!("Tool reference '{}' is not registered", name);
                            continue;
                        }
                    }
                }
            };
            for tool in matching {
                if seen.insert(tool.name.clone()) {
                    resolved.push(tool.clone());
                }
            }
        }
        resolved
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse, ToolError> {
        let (server, tool) = match name.split_once('.') {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => (server, tool),
            _ => return Err(ToolError::InvalidName(name.to_string())),
        };

        let entry = {
            let servers = self.servers.read().await;
            match servers.get(server) {
                Some(entry) => entry.clone(),
                None => {
                    return Err(ToolError::ServerNotFound {
                        server: server.to_string(),
                        available: join_or_none(servers.keys().cloned()),
                    });
                }
            }
        };

        if !entry.tools.iter().any(|t| t.tool == tool) {
            return Err(ToolError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
                available: join_or_none(entry.tools.iter().map(|t| t.tool.clone())),
            });
        }

        let call_error = |message: String| ToolError::Call {
            name: name.to_string(),
            message,
        };
        match &entry.backend {
            ServerBackend::Local(handlers) => {
                let handler = handlers.get(tool).cloned().ok_or_else(|| {
                    call_error("handler missing for registered tool".to_string())
                })?;
                // Spawned so a panicking handler surfaces as a call error.
                tokio::spawn(handler(arguments))
                    .await
                    .map_err(|e| call_error(e.to_string()))?
                    .map_err(|e| call_error(e.to_string()))
            }
            ServerBackend::Adapter(adapter) => adapter
                .call_tool(tool, arguments)
                .await
                .map_err(|e| call_error(e.to_string())),
        }
    }

    /// Returns whether a server was registered under `name`.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let removed = self.servers.write().await.remove(name);
        match removed {
            Some(entry) => {
                entry.disconnect(name).await;
                info!("Disconnected tool server [{}]", name);
                true
            }
            None => false,
        }
    }

    /// Disconnect every server in parallel. Failures are logged only.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Arc<ServerEntry>)> =
            self.servers.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for (name, entry) in drained {
            set.spawn(async move {
                entry.disconnect(&name).await;
                name
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Tool server disconnect task failed: {}", e);
            }
        }
        info!("All tool servers disconnected");
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ToolRegistry {
    fn name(&self) -> &'static str {
        "tools"
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        info!("Tool registry ready with {} server(s)", self.server_names().await.len());
        Ok(())
    }

    async fn on_shutdown(&self) -> anyhow::Result<()> {
        self.disconnect_all().await;
        Ok(())
    }
}

fn validate_server_name(name: &str) -> Result<(), ToolError> {
    if name.is_empty() || name.contains('.') {
        return Err(ToolError::InvalidServerName(name.to_string()));
    }
    Ok(())
}
