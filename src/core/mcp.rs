//! Stdio JSON-RPC client for subprocess tool servers.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::tools::env::inherited_env;
use crate::core::tools::{AdapterConnector, ServerConfig, ToolAdapter, ToolInfo, ToolResponse};

const INIT_TIMEOUT: Duration = Duration::from_secs(15);
const CALL_TIMEOUT: Duration = Duration::from_secs(300);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_CAPTURE_LIMIT: usize = 2000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct McpClient {
    server_name: String,
    state: Mutex<AdapterState>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    pending_requests: PendingMap,
    stdout_closed: Arc<AtomicBool>,
    tx_req: mpsc::Sender<String>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    stderr: Arc<Mutex<String>>,
}

impl McpClient {
    /// Spawn the server and complete the initialize handshake.
    pub async fn connect(server_name: &str, config: &ServerConfig) -> Result<Arc<Self>> {
        info!("Starting tool server [{}] ({})", server_name, config.command);

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .env_clear()
            .envs(inherited_env())
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn '{}': {}", config.command, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open tool server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to open tool server stdout"))?;
        let stderr_pipe = child.stderr.take();

        let (tx_req, mut rx_req) = mpsc::channel::<String>(100);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let pending_requests: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stdout_closed = Arc::new(AtomicBool::new(false));

        let client = Arc::new(Self {
            server_name: server_name.to_string(),
            state: Mutex::new(AdapterState::Connecting),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            pending_requests: pending_requests.clone(),
            stdout_closed: stdout_closed.clone(),
            tx_req,
            close_tx: Mutex::new(Some(close_tx)),
            stderr: Arc::new(Mutex::new(String::new())),
        });

        // Writer. Dropping stdin on close is the server's shutdown signal.
        let mut stdin_writer = tokio::io::BufWriter::new(stdin);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    msg = rx_req.recv() => {
                        let Some(msg) = msg else { break };
                        debug!("Tool server TX: {}", msg);
                        if let Err(e) = stdin_writer
                            .write_all(format!("{}\n", msg).as_bytes())
                            .await
                        {
                            error!("Failed to write to tool server stdin: {}", e);
                            break;
                        }
                        let _ = stdin_writer.flush().await;
                    }
                }
            }
            let _ = stdin_writer.shutdown().await;
        });

        // Reader
        let pending = pending_requests.clone();
        let reader_name = server_name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("Tool server RX [{}]: {}", reader_name, line);
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) => {
                        if let Some(tx) = pending.lock().await.remove(&resp.id) {
                            let _ = tx.send(resp);
                        }
                    }
                    Err(_) => warn!("Unparsed tool server RX [{}]: {}", reader_name, line),
                }
            }
            debug!("Tool server [{}] stdout closed", reader_name);
            stdout_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every in-flight call.
            pending.lock().await.clear();
        });

        if let Some(stderr_pipe) = stderr_pipe {
            let stderr_log = client.stderr.clone();
            let stderr_name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr_pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut s = stderr_log.lock().await;
                    if s.len() < STDERR_CAPTURE_LIMIT {
                        s.push_str(&line);
                        s.push('\n');
                    }
                    debug!("Tool server STDERR [{}]: {}", stderr_name, line);
                }
            });
        }

        let handshake = tokio::time::timeout(INIT_TIMEOUT, client.initialize()).await;
        let failure = match handshake {
            Err(_elapsed) => Some("initialization timed out".to_string()),
            Ok(Err(e)) => Some(format!("initialization failed: {}", e)),
            Ok(Ok(())) => None,
        };
        if let Some(reason) = failure {
            let err_log = client.stderr.lock().await.trim().to_string();
            error!(
                "Tool server [{}] {}. Stderr: {}",
                server_name, reason, err_log
            );
            client.shutdown().await;
            return Err(anyhow!("{}. Stderr: {}", reason, err_log));
        }

        *client.state.lock().await = AdapterState::Connected;
        info!("Tool server [{}] initialized", server_name);
        Ok(client)
    }

    pub async fn state(&self) -> AdapterState {
        *self.state.lock().await
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        let req_str = serde_json::to_string(&req)?;
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(id, tx);

        if self.stdout_closed.load(Ordering::SeqCst) || self.tx_req.send(req_str).await.is_err() {
            self.pending_requests.lock().await.remove(&id);
            return Err(anyhow!("tool server [{}] is not running", self.server_name));
        }

        let resp = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(anyhow!(
                    "tool server [{}] exited before responding",
                    self.server_name
                ));
            }
            Err(_) => {
                self.pending_requests.lock().await.remove(&id);
                return Err(anyhow!(
                    "tool server [{}] did not answer '{}' within {}s",
                    self.server_name,
                    method,
                    CALL_TIMEOUT.as_secs()
                ));
            }
        };
        if let Some(error) = resp.error {
            return Err(anyhow!("RPC error: {}", error));
        }
        resp.result.ok_or_else(|| anyhow!("RPC response missing result"))
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let state = self.state().await;
        if state != AdapterState::Connected {
            return Err(anyhow!(
                "tool server [{}] is {:?}",
                self.server_name,
                state
            ));
        }
        self.request(method, params).await
    }

    async fn initialize(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let resp = self.request("initialize", Some(params)).await?;
        debug!("Tool server [{}] initialized: {}", self.server_name, resp);

        let notif_str = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        })
        .to_string();
        self.tx_req.send(notif_str).await?;
        Ok(())
    }

    /// Close stdin, give the process a bounded time to exit, then kill it.
    async fn shutdown(&self) {
        *self.state.lock().await = AdapterState::Disconnecting;
        if let Some(close) = self.close_tx.lock().await.take() {
            let _ = close.send(());
        }
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Tool server [{}] did not exit within {}s; killing it",
                        self.server_name,
                        DISCONNECT_TIMEOUT.as_secs()
                    );
                    let _ = child.kill().await;
                }
            }
        }
        *self.state.lock().await = AdapterState::Disconnected;
    }
}

#[async_trait]
impl ToolAdapter for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.call("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| match serde_json::from_value::<ToolInfo>(t.clone()) {
                        Ok(info) => Some(info),
                        Err(e) => {
                            warn!("Skipping malformed tool from [{}]: {}", self.server_name, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResponse> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        let result = self.call("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state().await == AdapterState::Disconnected {
            return Ok(());
        }
        self.shutdown().await;
        info!("Tool server [{}] stopped", self.server_name);
        Ok(())
    }
}

/// Connects configured servers as stdio subprocesses.
pub struct McpConnector;

#[async_trait]
impl AdapterConnector for McpConnector {
    async fn connect(&self, name: &str, config: &ServerConfig) -> Result<Arc<dyn ToolAdapter>> {
        let client: Arc<dyn ToolAdapter> = McpClient::connect(name, config).await?;
        Ok(client)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A shell one-liner that answers every request with a canned result,
    /// echoing the request id back.
    fn scripted_server(result: &str) -> ServerConfig {
        let script = format!(
            r#"while IFS= read -r line; do
                 id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                 [ -n "$id" ] && printf '{{"jsonrpc":"2.0","id":%s,"result":%s}}\n' "$id" '{}'
               done"#,
            result
        );
        ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn handshake_list_and_disconnect() {
        let config = scripted_server(r#"{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}"#);
        let client = McpClient::connect("scripted", &config).await.unwrap();
        assert_eq!(client.state().await, AdapterState::Connected);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, AdapterState::Disconnected);
        // Second disconnect is a no-op.
        client.disconnect().await.unwrap();
        assert!(client.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn missing_binary_fails_to_connect() {
        let config = ServerConfig {
            command: "/nonexistent/tool-server".to_string(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(McpClient::connect("ghost", &config).await.is_err());
    }

    #[tokio::test]
    async fn server_exiting_during_handshake_is_an_error() {
        let config = ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            env: HashMap::new(),
        };
        let err = McpClient::connect("quitter", &config).await.err().unwrap();
        assert!(err.to_string().contains("initialization failed"));
    }
}
