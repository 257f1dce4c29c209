//! Aggregated tool metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between provider id and provider-local tool name in a tool id.
///
/// Friendly names never contain it, so any reference containing it is an id.
pub const ID_SEPARATOR: &str = "__";

/// One tool exposed by one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub id: String,
    pub provider_id: String,
    pub provider_name: String,
    pub local_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(
        provider_id: impl Into<String>,
        provider_name: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Self {
        let provider_id = provider_id.into();
        let local_name = local_name.into();
        Self {
            id: tool_id(&provider_id, &local_name),
            provider_id,
            provider_name: provider_name.into(),
            local_name,
            description: None,
            input_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

pub fn tool_id(provider_id: &str, local_name: &str) -> String {
    format!("{provider_id}{ID_SEPARATOR}{local_name}")
}

/// Split an id at the first separator into `(provider_id, local_name)`.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(ID_SEPARATOR)
}
