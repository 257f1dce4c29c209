//! One tool surface over many tool providers.
//!
//! Providers register tools under ids of the form `provider__tool`. The
//! gateway aggregates them into a cached [`ToolCatalog`], gives every tool a
//! collision-free camelCase name ([`NameMapping`]), and exposes four
//! operations through [`MetaServer`]:
//!
//! - `discover`: page through the catalog
//! - `inspect`: render a call stub for one tool
//! - `invoke`: call one tool
//! - `orchestrate`: run a script that chains tool calls in the sandbox
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gateway::{McpRegistry, MetaServer, ProviderConfig, ToolCatalog};
//! use mcp::ServerConfig;
//!
//! # async fn example() -> gateway::Result<()> {
//! let registry = Arc::new(McpRegistry::new());
//! registry
//!     .connect(ProviderConfig::new(
//!         "fs",
//!         "Files",
//!         ServerConfig::new("fs", "mcp-filesystem"),
//!     ))
//!     .await?;
//!
//! let server = MetaServer::new(Arc::new(ToolCatalog::new(registry)));
//! let result = server
//!     .handle(
//!         "orchestrate",
//!         serde_json::json!({ "code": "return await mcp.callTool('filesReadFile', { path: 'a.txt' })" }),
//!     )
//!     .await;
//! println!("{:?}", result.first_text());
//! # Ok(())
//! # }
//! ```

mod bridge;
mod catalog;
mod descriptor;
mod error;
mod names;
mod registry;
mod server;

pub use bridge::{Resolved, ToolBridge, normalize};
pub use catalog::{DEFAULT_TTL, Listing, Page, Snapshot, ToolCatalog};
pub use descriptor::{ID_SEPARATOR, ToolDescriptor, split_id, tool_id};
pub use error::{Error, Result};
pub use names::NameMapping;
pub use registry::{McpRegistry, ProviderConfig, ProviderRegistry, validate_provider_id};
pub use server::{
    DEFAULT_LIMIT, MAX_LIMIT, MAX_TIMEOUT, MetaOptions, MetaServer, Operation, render_stub,
};
