//! The four caller-facing operations.

use std::sync::Arc;
use std::time::Duration;

use mcp::{CallToolResult, Tool};
use sandbox::{ExecutionResult, SandboxOptions, SandboxRuntime};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::bridge::ToolBridge;
use crate::catalog::{Page, ToolCatalog};
use crate::descriptor::ToolDescriptor;
use crate::{Error, Result};

pub const DEFAULT_LIMIT: usize = 30;
pub const MAX_LIMIT: usize = 100;
pub const MAX_TIMEOUT: Duration = Duration::from_millis(300_000);

/// A parsed request for one meta operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Discover { limit: usize, offset: usize },
    Inspect { name: String },
    Invoke { name: String, params: Value },
    Orchestrate { code: String, timeout_ms: Option<u64> },
}

impl Operation {
    /// Parse an operation name and its arguments.
    ///
    /// Paging arguments are clamped; a missing required argument or an
    /// unknown operation is an error.
    pub fn parse(name: &str, args: &Value) -> Result<Self> {
        let empty = Map::new();
        let args = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(Error::InvalidArgument(
                    "arguments must be an object".into(),
                ));
            }
        };

        match name {
            "discover" => Ok(Operation::Discover {
                limit: number(args, "limit")
                    .map_or(DEFAULT_LIMIT, |n| n.clamp(1.0, MAX_LIMIT as f64) as usize),
                offset: number(args, "offset").map_or(0, |n| n.max(0.0) as usize),
            }),
            "inspect" => Ok(Operation::Inspect {
                name: required_str(args, "name")?,
            }),
            "invoke" => Ok(Operation::Invoke {
                name: required_str(args, "name")?,
                params: match args.get("params") {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(params) => params.clone(),
                },
            }),
            "orchestrate" => Ok(Operation::Orchestrate {
                code: required_str(args, "code")?,
                timeout_ms: number(args, "timeoutMs").map(|n| n.max(1.0) as u64),
            }),
            other => Err(Error::InvalidArgument(format!("unknown operation: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Discover { .. } => "discover",
            Operation::Inspect { .. } => "inspect",
            Operation::Invoke { .. } => "invoke",
            Operation::Orchestrate { .. } => "orchestrate",
        }
    }
}

fn number(args: &Map<String, Value>, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64).map(f64::floor)
}

fn required_str(args: &Map<String, Value>, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => Err(Error::InvalidArgument(
            format!("missing required argument: {key}"),
        )),
        Some(_) => Err(Error::InvalidArgument(format!("{key} must be a string"))),
    }
}

/// Sandbox limits applied by [`MetaServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaOptions {
    pub sandbox: SandboxOptions,
    /// Upper bound for a caller-supplied `timeoutMs`.
    pub max_timeout: Duration,
}

impl Default for MetaOptions {
    fn default() -> Self {
        Self {
            sandbox: SandboxOptions::default(),
            max_timeout: MAX_TIMEOUT,
        }
    }
}

/// Discover, inspect, invoke and orchestrate over one tool catalog.
pub struct MetaServer {
    catalog: Arc<ToolCatalog>,
    bridge: Arc<ToolBridge>,
    sandbox: SandboxRuntime,
    max_timeout: Duration,
}

impl MetaServer {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self::with_options(catalog, MetaOptions::default())
    }

    pub fn with_options(catalog: Arc<ToolCatalog>, options: MetaOptions) -> Self {
        let bridge = Arc::new(ToolBridge::new(catalog.clone()));
        let sandbox = SandboxRuntime::with_options(bridge.clone(), options.sandbox);
        Self {
            catalog,
            bridge,
            sandbox,
            max_timeout: options.max_timeout,
        }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn bridge(&self) -> &Arc<ToolBridge> {
        &self.bridge
    }

    /// Descriptors for the four operations, for advertising to callers.
    pub fn tool_specs() -> Vec<Tool> {
        vec![
            Tool {
                name: "discover".into(),
                description: Some(
                    "List available tools with their callable names, a page at a time.".into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT, "default": DEFAULT_LIMIT},
                        "offset": {"type": "integer", "minimum": 0, "default": 0}
                    }
                }),
            },
            Tool {
                name: "inspect".into(),
                description: Some("Show how to call one tool, rendered from its input schema.".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Tool name or id"}
                    },
                    "required": ["name"]
                }),
            },
            Tool {
                name: "invoke".into(),
                description: Some("Call one tool and return its result.".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Tool name or id"},
                        "params": {"type": "object", "description": "Tool arguments"}
                    },
                    "required": ["name"]
                }),
            },
            Tool {
                name: "orchestrate".into(),
                description: Some(
                    "Run a script that chains tool calls with `await mcp.callTool(name, params)`. \
                     Use `parallel(...)` or `settle(...)` for concurrency and `return` the result."
                        .into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Async function body"},
                        "timeoutMs": {"type": "integer", "minimum": 1, "description": "Deadline in milliseconds"}
                    },
                    "required": ["code"]
                }),
            },
        ]
    }

    /// Parse and run one operation. Every failure becomes an error result.
    pub async fn handle(&self, name: &str, args: Value) -> CallToolResult {
        match Operation::parse(name, &args) {
            Ok(operation) => self.execute(operation).await,
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    pub async fn execute(&self, operation: Operation) -> CallToolResult {
        let op = operation.name();
        debug!(operation = op, "handling meta operation");
        let outcome = match operation {
            Operation::Discover { limit, offset } => self
                .discover(limit, offset)
                .await
                .and_then(|page| to_text(&page)),
            Operation::Inspect { name } => self.inspect(&name).await.map(CallToolResult::text),
            Operation::Invoke { name, params } => {
                self.invoke(&name, params).await.map(CallToolResult::text)
            }
            Operation::Orchestrate { code, timeout_ms } => self
                .orchestrate(&code, timeout_ms)
                .await
                .and_then(|result| {
                    let mut text = to_text(&result)?;
                    text.is_error = result.is_error;
                    Ok(text)
                }),
        };
        outcome.unwrap_or_else(|e| {
            info!(operation = op, error = %e, "meta operation failed");
            CallToolResult::error(e.to_string())
        })
    }

    pub async fn discover(&self, limit: usize, offset: usize) -> Result<Page> {
        self.catalog.page(limit.clamp(1, MAX_LIMIT), offset).await
    }

    /// Render a call stub for one tool.
    pub async fn inspect(&self, name: &str) -> Result<String> {
        let resolved = self.bridge.describe(name).await?;
        Ok(render_stub(&resolved.name, &resolved.tool))
    }

    /// Call one tool; the result is returned as text.
    pub async fn invoke(&self, name: &str, params: Value) -> Result<String> {
        self.catalog.get().await?;
        let value = self.bridge.call(name, params, None).await?;
        Ok(match value {
            Value::String(text) => text,
            other => serde_json::to_string_pretty(&other)
                .map_err(|e| Error::Provider(e.to_string()))?,
        })
    }

    /// Run a script. `timeout_ms` is clamped to the configured maximum.
    pub async fn orchestrate(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionResult> {
        self.catalog.get().await?;
        let timeout = timeout_ms
            .map(|ms| Duration::from_millis(ms.max(1)).min(self.max_timeout))
            .unwrap_or(self.sandbox.options().timeout);
        Ok(self.sandbox.execute_with_timeout(code, timeout).await)
    }
}

fn to_text(value: &impl serde::Serialize) -> Result<CallToolResult> {
    serde_json::to_string_pretty(value)
        .map(CallToolResult::text)
        .map_err(|e| Error::Provider(e.to_string()))
}

/// A usage stub derived from a tool's input schema.
///
/// Required parameters come first, optional ones are marked `name?`,
/// enums render as literal alternatives and arrays or objects generically.
pub fn render_stub(name: &str, tool: &ToolDescriptor) -> String {
    let mut lines = Vec::new();
    if let Some(description) = tool.description.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.extend(description.trim().lines().map(|line| format!("// {line}")));
    }
    lines.push(format!("// id: {} (provider: {})", tool.id, tool.provider_name));

    let params = parameters(tool.input_schema.as_ref());
    for param in params.iter().filter(|p| p.description.is_some()) {
        let mark = if param.required { "" } else { "?" };
        lines.push(format!(
            "//   {}{mark}: {}",
            param.name,
            param.description.as_deref().unwrap_or_default()
        ));
    }

    let fields: Vec<String> = params
        .iter()
        .map(|p| {
            let mark = if p.required { "" } else { "?" };
            format!("{}{mark}: {}", p.name, p.ty)
        })
        .collect();
    let args = if fields.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {} }}", fields.join(", "))
    };
    lines.push(format!("await mcp.callTool({name:?}, {args})"));
    lines.join("\n")
}

struct Param {
    name: String,
    ty: String,
    required: bool,
    description: Option<String>,
}

fn parameters(schema: Option<&Value>) -> Vec<Param> {
    let Some(properties) = schema
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let param = |name: &str, prop: &Value, required: bool| Param {
        name: name.to_string(),
        ty: type_of(prop),
        required,
        description: prop
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let mut params: Vec<Param> = required
        .iter()
        .filter_map(|name| properties.get(*name).map(|prop| param(*name, prop, true)))
        .collect();
    params.extend(
        properties
            .iter()
            .filter(|(name, _)| !required.contains(&name.as_str()))
            .map(|(name, prop)| param(name.as_str(), prop, false)),
    );
    params
}

fn type_of(prop: &Value) -> String {
    if let Some(values) = prop.get("enum").and_then(Value::as_array) {
        return values
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
    }
    match prop.get("type") {
        Some(Value::String(ty)) => simple_type(ty).to_string(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .map(simple_type)
            .collect::<Vec<_>>()
            .join(" | "),
        _ => "any".to_string(),
    }
}

fn simple_type(ty: &str) -> &str {
    match ty {
        "integer" | "number" => "number",
        "array" => "any[]",
        "object" => "object",
        "string" | "boolean" | "null" => ty,
        _ => "any",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_arguments_are_clamped() {
        let op = Operation::parse("discover", &json!({"limit": 500, "offset": -3})).unwrap();
        assert_eq!(op, Operation::Discover { limit: 100, offset: 0 });

        let op = Operation::parse("discover", &json!({"limit": 0})).unwrap();
        assert_eq!(op, Operation::Discover { limit: 1, offset: 0 });

        let op = Operation::parse("discover", &Value::Null).unwrap();
        assert_eq!(op, Operation::Discover { limit: 30, offset: 0 });

        let op = Operation::parse("discover", &json!({"limit": "ten", "offset": 2.7})).unwrap();
        assert_eq!(op, Operation::Discover { limit: 30, offset: 2 });
    }

    #[test]
    fn required_arguments_are_enforced() {
        for (name, args) in [
            ("inspect", json!({})),
            ("invoke", json!({"params": {}})),
            ("orchestrate", json!({"code": "  "})),
        ] {
            let err = Operation::parse(name, &args).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{name}: {err}");
        }
        let err = Operation::parse("inspect", &json!({"name": 7})).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: name must be a string");
    }

    #[test]
    fn unknown_operations_fail() {
        let err = Operation::parse("delete", &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: unknown operation: delete");
        let err = Operation::parse("discover", &json!([1])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn invoke_and_orchestrate_defaults() {
        let op = Operation::parse("invoke", &json!({"name": "x"})).unwrap();
        assert_eq!(
            op,
            Operation::Invoke {
                name: "x".into(),
                params: json!({})
            }
        );
        let op = Operation::parse("orchestrate", &json!({"code": "return 1", "timeoutMs": -5})).unwrap();
        assert_eq!(
            op,
            Operation::Orchestrate {
                code: "return 1".into(),
                timeout_ms: Some(1)
            }
        );
    }

    #[test]
    fn stub_orders_required_first() {
        let tool = ToolDescriptor::new("gh", "GitHub", "search_repos")
            .with_description("Search repositories")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "archived": {"type": "boolean"},
                    "query": {"type": "string", "description": "Search terms"},
                    "sort": {"enum": ["stars", "forks"]},
                    "topics": {"type": "array", "items": {"type": "string"}},
                    "filter": {"type": "object"},
                    "limit": {"type": ["integer", "null"]}
                },
                "required": ["query"]
            }));
        let stub = render_stub("gitHubSearchRepos", &tool);
        assert_eq!(
            stub,
            [
                "// Search repositories",
                "// id: gh__search_repos (provider: GitHub)",
                "//   query: Search terms",
                r#"await mcp.callTool("gitHubSearchRepos", { query: string, archived?: boolean, filter?: object, limit?: number | null, sort?: "stars" | "forks", topics?: any[] })"#,
            ]
            .join("\n")
        );
    }

    #[test]
    fn stub_without_schema_takes_no_arguments() {
        let tool = ToolDescriptor::new("web", "", "ping");
        assert_eq!(
            render_stub("ping", &tool),
            "// id: web__ping (provider: )\nawait mcp.callTool(\"ping\", {})"
        );
    }

    #[test]
    fn specs_cover_every_operation() {
        let names: Vec<_> = MetaServer::tool_specs().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["discover", "inspect", "invoke", "orchestrate"]);
    }
}
