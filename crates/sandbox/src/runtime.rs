//! Script execution under a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;

use crate::builtins;
use crate::error::ToolCallError;
use crate::interp::{Host, Interpreter};
use crate::logs::LogBuffer;
use crate::parser::parse_script;
use crate::value::Exception;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Host side of `mcp.callTool`.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Call a tool by friendly name or id, tagged with `call_id`.
    async fn call_tool(
        &self,
        name: &str,
        params: Json,
        call_id: &str,
    ) -> Result<Json, ToolCallError>;

    /// Ask the provider to stop the call tagged `call_id`. Must not block.
    fn abort(&self, call_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxOptions {
    pub timeout: Duration,
    pub max_log_entries: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_log_entries: MAX_LOG_ENTRIES,
        }
    }
}

/// Outcome of one script execution.
///
/// `result` is absent when the script returned `undefined`, threw, or timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl ExecutionResult {
    pub fn success(result: Option<Json>, logs: Vec<String>) -> Self {
        Self {
            result,
            error: None,
            logs,
            is_error: false,
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            logs,
            is_error: true,
        }
    }
}

/// Runs orchestration scripts against a [`ToolInvoker`].
///
/// Each execution gets a fresh global scope; nothing carries over between runs.
pub struct SandboxRuntime {
    invoker: Arc<dyn ToolInvoker>,
    options: SandboxOptions,
}

impl SandboxRuntime {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self::with_options(invoker, SandboxOptions::default())
    }

    pub fn with_options(invoker: Arc<dyn ToolInvoker>, options: SandboxOptions) -> Self {
        Self { invoker, options }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Execute with the configured default deadline.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        self.execute_with_timeout(code, self.options.timeout).await
    }

    pub async fn execute_with_timeout(&self, code: &str, timeout: Duration) -> ExecutionResult {
        let body = match parse_script(code) {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(error = %err, "script rejected");
                return ExecutionResult::failure(err.to_string(), Vec::new());
            }
        };

        let logs = Arc::new(LogBuffer::new(self.options.max_log_entries));
        let started = Instant::now();
        let host = Arc::new(Host::new(
            self.invoker.clone(),
            logs.clone(),
            started + timeout,
        ));

        // Trips the token at the deadline so suspended awaits wake up.
        let watchdog = {
            let cancel = host.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let globals = builtins::globals();
        let outcome = Interpreter::new(host.clone()).run(&body, &globals).await;
        watchdog.abort();
        host.cancel.cancel();

        let timed_out = matches!(outcome, Err(Exception::Cancelled));
        let abandoned = if timed_out {
            host.issued()
        } else {
            host.outstanding()
        };
        for call_id in &abandoned {
            tracing::info!(call_id = %call_id, "aborting tool call");
            self.invoker.abort(call_id);
        }

        let logs = logs.snapshot();
        let result = match outcome {
            Ok(value) => match value.to_json() {
                Ok(result) => ExecutionResult::success(result, logs),
                Err(Exception::Thrown(err)) => ExecutionResult::failure(err.error_message(), logs),
                Err(Exception::Cancelled) => timeout_result(timeout, logs),
            },
            Err(Exception::Thrown(err)) => ExecutionResult::failure(err.error_message(), logs),
            Err(Exception::Cancelled) => timeout_result(timeout, logs),
        };

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error,
            aborted = abandoned.len(),
            "script finished"
        );
        result
    }
}

fn timeout_result(timeout: Duration, logs: Vec<String>) -> ExecutionResult {
    ExecutionResult::failure(
        format!("Execution timed out after {}ms", timeout.as_millis()),
        logs,
    )
}
