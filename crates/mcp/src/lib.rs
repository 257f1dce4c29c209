//! Client library for external tool servers.
//!
//! Tool servers speak JSON-RPC 2.0 over stdio. This crate provides the wire
//! types and a client that spawns one server, performs the handshake, lists
//! its tools and calls them, with any number of calls in flight at once.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{RequestId, Server, ServerConfig};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::new("filesystem", "mcp-filesystem")
//!     .with_args(["--root", "./workspace"]);
//!
//! let server = Server::spawn(config).await?;
//! server.initialize().await?;
//!
//! for tool in server.tools().await {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = server
//!     .call_tool_with_id(
//!         "read_file",
//!         Some(serde_json::json!({ "path": "./README.md" })),
//!         RequestId::from("call-1"),
//!     )
//!     .await?;
//! println!("{:?}", result.first_text());
//!
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod server;

pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, CancelledParams, EmbeddedResource, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, PROTOCOL_VERSION, RequestId, ServerCapabilities, ServerInfo, Tool,
    ToolContent,
};
pub use server::{DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, Server, ServerConfig};
