//! Tool-server process management (spawn, communicate, lifecycle).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, CancelledParams, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, Tool,
};

/// Default timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum output size (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Configuration for a tool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

type Waiter = oneshot::Sender<Result<JsonRpcResponse>>;

/// Requests awaiting a response, keyed by JSON-RPC id.
#[derive(Default)]
struct PendingRequests {
    waiters: HashMap<RequestId, Waiter>,
    closed: bool,
}

type SharedPending = Arc<Mutex<PendingRequests>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a waiter if the requesting future goes away before its response.
struct PendingGuard<'a> {
    pending: &'a SharedPending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

/// Handle to a running tool server.
///
/// Requests are multiplexed: any number of calls may be in flight at once
/// and a background reader routes each response to its caller by id.
pub struct Server {
    config: ServerConfig,
    process: AsyncMutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    pending: SharedPending,
    reader: JoinHandle<()>,
    next_id: AtomicI64,
    initialized: AtomicBool,
    server_info: AsyncMutex<Option<InitializeResult>>,
    tools: AsyncMutex<Vec<Tool>>,
}

impl Server {
    /// Spawn a new tool server process.
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn()?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let pending = SharedPending::default();
        let reader = tokio::spawn(read_loop(stdout, pending.clone(), config.name.clone()));

        Ok(Self {
            config,
            process: AsyncMutex::new(process),
            stdin: AsyncMutex::new(stdin),
            pending,
            reader,
            next_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            server_info: AsyncMutex::new(None),
            tools: AsyncMutex::new(Vec::new()),
        })
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Initialize the server (must be called before other operations).
    pub async fn initialize(&self) -> Result<&Self> {
        let params = InitializeParams::default();
        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        debug!(
            server = %self.config.name,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "tool server initialized"
        );

        self.notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;

        *self.server_info.lock().await = Some(result);
        self.initialized.store(true, Ordering::SeqCst);

        self.refresh_tools().await?;

        Ok(self)
    }

    /// Check if the server is initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Get server info (after initialization).
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Refresh the list of available tools, following pagination cursors.
    pub async fn refresh_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult = self.request("tools/list", params).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        *self.tools.lock().await = tools.clone();
        Ok(tools)
    }

    /// Get the tools seen by the last refresh.
    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.lock().await.clone()
    }

    /// Call a tool by name.
    ///
    /// A result flagged `isError` is returned as-is; interpreting it is up
    /// to the caller.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let id = self.next_request_id();
        self.call_tool_with_id(name, arguments, id).await
    }

    /// Call a tool using a caller-chosen request id, so the call can later
    /// be targeted by [`Server::cancel`].
    pub async fn call_tool_with_id(
        &self,
        name: &str,
        arguments: Option<Value>,
        id: RequestId,
    ) -> Result<CallToolResult> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        self.request_with_id(id, "tools/call", Some(params)).await
    }

    /// Cancel an in-flight request.
    ///
    /// The local waiter (if still present) fails with [`Error::Cancelled`]
    /// and the server is sent `notifications/cancelled`. Whether the server
    /// actually stops is up to the server.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> Result<()> {
        if let Some(waiter) = lock(&self.pending).waiters.remove(id) {
            let _ = waiter.send(Err(Error::Cancelled(id.to_string())));
        }

        let params = CancelledParams {
            request_id: id.clone(),
            reason: reason.map(str::to_string),
        };
        self.notify(JsonRpcNotification::new("notifications/cancelled").with_params(params))
            .await
    }

    /// Check if the server process is still running.
    pub async fn is_running(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Shut down the server.
    pub async fn shutdown(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        let _ = process.kill().await;
        self.reader.abort();
        Ok(())
    }

    // --- Internal methods ---

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        self.request_with_id(id, method, params).await
    }

    async fn request_with_id<P, R>(&self, id: RequestId, method: &str, params: Option<P>) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(p) = params {
            request = request.with_params(p);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(Error::ServerExited);
            }
            pending.waiters.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        self.write_line(&serde_json::to_string(&request)?).await?;

        let response = match timeout(self.config.timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(Error::Cancelled(id.to_string())),
            Err(_) => {
                return Err(Error::Timeout {
                    method: method.to_string(),
                });
            }
        };

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;

        Ok(result)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route every response line from the server to the request waiting on it.
async fn read_loop(stdout: ChildStdout, pending: SharedPending, server: String) {
    let mut stdout = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%server, error = %e, "failed to read from tool server");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                warn!(%server, error = %e, "ignoring malformed line from tool server");
                continue;
            }
        };

        if message.get("method").is_some() {
            debug!(%server, method = ?message.get("method"), "ignoring server-initiated message");
            continue;
        }

        let outcome = if trimmed.len() > MAX_OUTPUT_SIZE {
            Err(Error::OutputTooLarge {
                size: trimmed.len(),
                max: MAX_OUTPUT_SIZE,
            })
        } else {
            Ok(())
        };

        let response: JsonRpcResponse = match serde_json::from_value(message) {
            Ok(response) => response,
            Err(e) => {
                warn!(%server, error = %e, "ignoring response without a usable id");
                continue;
            }
        };

        let waiter = lock(&pending).waiters.remove(&response.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome.map(|()| response));
            }
            None => debug!(%server, id = %response.id, "response for a request nobody awaits"),
        }
    }

    let mut pending = lock(&pending);
    pending.closed = true;
    for (_, waiter) in pending.waiters.drain() {
        let _ = waiter.send(Err(Error::ServerExited));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const HANDSHAKE: &str = r#"
read -r line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake"}}}'
read -r line
read -r line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
"#;

    fn fake_server(script: &str) -> ServerConfig {
        let mut config = ServerConfig::new("fake", "sh").with_args(["-c".to_string(), format!("{HANDSHAKE}{script}")]);
        config.timeout = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn initialize_lists_tools_and_calls() {
        let script = r#"
read -r line
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
echo '{"jsonrpc":"2.0","id":"call-1","result":{"content":[{"type":"text","text":"hi"}]}}'
sleep 1
"#;
        let server = Server::spawn(fake_server(script)).await.unwrap();
        server.initialize().await.unwrap();

        let tools = server.tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = server
            .call_tool_with_id("echo", None, RequestId::from("call-1"))
            .await
            .unwrap();
        assert_eq!(result.first_text(), Some("hi"));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_fails_the_waiting_call() {
        let script = r#"
read -r line
read -r line
sleep 5
"#;
        let server = Arc::new(Server::spawn(fake_server(script)).await.unwrap());
        server.initialize().await.unwrap();

        let caller = server.clone();
        let call = tokio::spawn(async move {
            caller
                .call_tool_with_id("slow", None, RequestId::from("call-2"))
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        server
            .cancel(&RequestId::from("call-2"), Some("test"))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "unexpected error: {err}");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exit_fails_pending_requests() {
        let script = "read -r line\n";
        let server = Server::spawn(fake_server(script)).await.unwrap();
        server.initialize().await.unwrap();

        let err = server.call_tool("echo", None).await.unwrap_err();
        assert!(matches!(err, Error::ServerExited), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn calls_require_initialization() {
        let server = Server::spawn(fake_server("")).await.unwrap();
        let err = server.call_tool("echo", None).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }
}
