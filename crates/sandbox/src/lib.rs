//! Sandboxed execution of orchestration scripts.
//!
//! Scripts are written in a small JavaScript subset and run as the body of
//! an async function. The only host bindings are:
//!
//! - `mcp.callTool(nameOrId, params)` and `mcp.log(level, message, fields?)`
//! - `console.log/info/warn/error/debug(...)`
//! - `parallel(...awaitables)` (fail-fast) and `settle(...awaitables)`
//!
//! Execution runs under a single deadline. When it passes, every tool call
//! the script issued is aborted through the [`ToolInvoker`] and the result
//! reports a timeout.
//!
//! # Example
//!
//! ```ignore
//! use sandbox::SandboxRuntime;
//!
//! let runtime = SandboxRuntime::new(invoker);
//! let result = runtime
//!     .execute(
//!         r#"
//!         const [a, b] = await parallel(
//!             mcp.callTool("githubSearch", { q: "rust" }),
//!             mcp.callTool("githubSearch", { q: "tokio" }),
//!         );
//!         return a.total + b.total;
//!         "#,
//!     )
//!     .await;
//! assert!(!result.is_error);
//! ```

mod ast;
mod builtins;
mod error;
mod interp;
mod lexer;
mod logs;
mod parser;
mod runtime;
mod value;

pub use error::{Result, SyntaxError, ToolCallError};
pub use runtime::{
    DEFAULT_TIMEOUT, ExecutionResult, MAX_LOG_ENTRIES, SandboxOptions, SandboxRuntime,
    ToolInvoker,
};
