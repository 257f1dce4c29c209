//! Turns a tool reference into a provider call.

use std::sync::Arc;

use async_trait::async_trait;
use mcp::CallToolResult;
use sandbox::{ToolCallError, ToolInvoker};
use serde_json::Value;
use tracing::debug;

use crate::catalog::{Snapshot, ToolCatalog};
use crate::descriptor::ToolDescriptor;
use crate::{Error, Result};

/// A resolved tool and the name it currently goes by.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub name: String,
    pub tool: ToolDescriptor,
}

pub struct ToolBridge {
    catalog: Arc<ToolCatalog>,
}

impl ToolBridge {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// Resolve a friendly name or id to an id.
    ///
    /// Ids are accepted as-is. A name the current snapshot does not know
    /// triggers one forced refresh before giving up.
    pub async fn resolve(&self, name_or_id: &str) -> Result<String> {
        self.retrying(name_or_id, |snapshot| {
            snapshot.names().resolve(name_or_id).map(str::to_string)
        })
        .await
    }

    /// Resolve to the full descriptor without calling anything.
    pub async fn describe(&self, name_or_id: &str) -> Result<Resolved> {
        self.retrying(name_or_id, |snapshot| {
            snapshot.lookup(name_or_id).map(|tool| Resolved {
                name: snapshot
                    .friendly_name(&tool.id)
                    .unwrap_or(&tool.id)
                    .to_string(),
                tool: tool.clone(),
            })
        })
        .await
    }

    async fn retrying<T>(
        &self,
        name_or_id: &str,
        find: impl Fn(&Snapshot) -> Option<T>,
    ) -> Result<T> {
        let refreshes = self.catalog.refresh_count();
        if let Some(found) = find(&*self.catalog.get().await?) {
            return Ok(found);
        }
        // A snapshot rebuilt by that `get` already counts as the retry.
        if self.catalog.refresh_count() != refreshes {
            return Err(Error::NotFound(name_or_id.to_string()));
        }
        debug!(tool = %name_or_id, "unknown tool, refreshing catalog");
        find(&*self.catalog.refresh().await?).ok_or_else(|| Error::NotFound(name_or_id.to_string()))
    }

    /// Resolve, dispatch, and normalize the provider's answer.
    pub async fn call(&self, name_or_id: &str, params: Value, call_id: Option<&str>) -> Result<Value> {
        let id = self.resolve(name_or_id).await?;
        debug!(tool = %id, call_id = ?call_id, "calling tool");
        let result = self
            .catalog
            .registry()
            .call_by_id(&id, params, call_id)
            .await?;
        normalize(result)
    }
}

/// Reduce a provider result to plain data.
///
/// Error results become [`Error::Provider`] with the first text block.
/// Successful results yield the first text block parsed as JSON, else the
/// text itself, else the whole result.
pub fn normalize(result: CallToolResult) -> Result<Value> {
    if result.is_error {
        let message = result.first_text().unwrap_or("tool call failed");
        return Err(Error::Provider(message.to_string()));
    }
    match result.first_text() {
        Some(text) => Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))),
        None => serde_json::to_value(&result).map_err(|e| Error::Provider(e.to_string())),
    }
}

#[async_trait]
impl ToolInvoker for ToolBridge {
    async fn call_tool(
        &self,
        name: &str,
        params: Value,
        call_id: &str,
    ) -> std::result::Result<Value, ToolCallError> {
        self.call(name, params, Some(call_id))
            .await
            .map_err(|e| ToolCallError(e.to_string()))
    }

    fn abort(&self, call_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.catalog.registry().clone();
        let call_id = call_id.to_string();
        handle.spawn(async move {
            registry.abort(&call_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::ToolContent;
    use serde_json::json;

    #[test]
    fn json_text_is_parsed() {
        let value = normalize(CallToolResult::text(r#"{"count": 3}"#)).unwrap();
        assert_eq!(value, json!({"count": 3}));
    }

    #[test]
    fn plain_text_stays_text() {
        let value = normalize(CallToolResult::text("hello there")).unwrap();
        assert_eq!(value, json!("hello there"));
    }

    #[test]
    fn results_without_text_are_returned_whole() {
        let result = CallToolResult {
            content: vec![ToolContent::Image {
                data: "aGk=".into(),
                mime_type: "image/png".into(),
            }],
            is_error: false,
        };
        let value = normalize(result).unwrap();
        assert_eq!(value["content"][0]["type"], "image");
    }

    #[test]
    fn error_results_surface_provider_text() {
        let err = normalize(CallToolResult::error("rate limited")).unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m == "rate limited"));
        assert_eq!(err.to_string(), "rate limited");

        let bare = CallToolResult {
            content: Vec::new(),
            is_error: true,
        };
        assert_eq!(normalize(bare).unwrap_err().to_string(), "tool call failed");
    }
}
