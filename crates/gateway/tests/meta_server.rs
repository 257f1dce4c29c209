//! MetaServer over an in-memory provider registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway::{
    Error, MetaOptions, MetaServer, ProviderRegistry, Result, ToolCatalog, ToolDescriptor,
};
use mcp::CallToolResult;
use sandbox::SandboxOptions;
use serde_json::{Value, json};

struct FakeRegistry {
    tools: Mutex<Vec<ToolDescriptor>>,
    lists: AtomicU64,
    calls: Mutex<Vec<(String, Value, Option<String>)>>,
    aborted: Mutex<Vec<String>>,
}

impl FakeRegistry {
    fn new(tools: Vec<ToolDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(tools),
            lists: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
        })
    }

    fn lists(&self) -> u64 {
        self.lists.load(Ordering::SeqCst)
    }

    fn calls(&self) -> Vec<(String, Value, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderRegistry for FakeRegistry {
    async fn list_all(&self) -> Result<Vec<ToolDescriptor>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_by_id(
        &self,
        id: &str,
        params: Value,
        call_id: Option<&str>,
    ) -> Result<CallToolResult> {
        self.calls
            .lock()
            .unwrap()
            .push((id.to_string(), params.clone(), call_id.map(str::to_string)));
        match id {
            "gh__search_repos" => Ok(CallToolResult::text(
                json!({"total": 2, "query": params["query"]}).to_string(),
            )),
            "gh__searchRepos" => Ok(CallToolResult::text("plain text answer")),
            "slack__post_message" => Ok(CallToolResult::error("channel_not_found")),
            "slow__wait" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(CallToolResult::text("late"))
            }
            other => Err(Error::NotFound(other.to_string())),
        }
    }

    async fn abort(&self, call_id: &str) -> bool {
        self.aborted.lock().unwrap().push(call_id.to_string());
        true
    }
}

fn catalog_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new("slack", "Slack", "post_message")
            .with_description("Post a message")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "channel": {"type": "string"},
                    "text": {"type": "string"}
                },
                "required": ["text", "channel"]
            })),
        ToolDescriptor::new("gh", "GitHub", "search_repos").with_description("Search repositories"),
        ToolDescriptor::new("gh", "GitHub", "searchRepos"),
    ]
}

fn setup() -> (Arc<FakeRegistry>, MetaServer) {
    let registry = FakeRegistry::new(catalog_tools());
    let catalog = Arc::new(ToolCatalog::new(registry.clone()));
    (registry, MetaServer::new(catalog))
}

fn body(result: &CallToolResult) -> Value {
    serde_json::from_str(result.first_text().unwrap()).unwrap()
}

#[tokio::test]
async fn discover_lists_every_tool() {
    let (_, server) = setup();
    let result = server
        .handle("discover", json!({"limit": 100, "offset": 0}))
        .await;
    assert!(!result.is_error);

    let page = body(&result);
    assert_eq!(page["total"], 3);
    assert_eq!(page["hasMore"], false);
    let names: Vec<&str> = page["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        ["gitHubSearchRepos", "gitHubSearchRepos_2", "slackPostMessage"]
    );
    assert_eq!(page["tools"][0]["id"], "gh__searchRepos");
    assert_eq!(page["tools"][2]["provider"], "Slack");
}

#[tokio::test]
async fn discover_pages_and_clamps() {
    let (_, server) = setup();
    let page = body(&server.handle("discover", json!({"limit": 1, "offset": 1})).await);
    assert_eq!(page["tools"].as_array().unwrap().len(), 1);
    assert_eq!(page["tools"][0]["id"], "gh__search_repos");
    assert_eq!(page["hasMore"], true);

    let page = body(&server.handle("discover", json!({"limit": 1000, "offset": -1})).await);
    assert_eq!(page["limit"], 100);
    assert_eq!(page["offset"], 0);
}

#[tokio::test]
async fn names_are_stable_for_the_same_catalog() {
    let first = setup().1.handle("discover", json!({})).await;

    let mut reversed = catalog_tools();
    reversed.reverse();
    let catalog = Arc::new(ToolCatalog::new(FakeRegistry::new(reversed)));
    let second = MetaServer::new(catalog).handle("discover", json!({})).await;

    assert_eq!(body(&first), body(&second));
}

#[tokio::test]
async fn invalidation_rebuilds_exactly_once() {
    let (registry, server) = setup();
    server.handle("discover", json!({})).await;
    server.handle("invoke", json!({"name": "gitHubSearchRepos_2"})).await;
    assert_eq!(registry.lists(), 1);

    server.catalog().invalidate();
    server.handle("discover", json!({})).await;
    server
        .handle("orchestrate", json!({"code": "return 1"}))
        .await;
    server.handle("invoke", json!({"name": "gitHubSearchRepos_2"})).await;
    assert_eq!(registry.lists(), 2);
}

#[tokio::test]
async fn new_tools_are_found_after_one_refresh() {
    let (registry, server) = setup();
    server.handle("discover", json!({})).await;
    registry
        .tools
        .lock()
        .unwrap()
        .push(ToolDescriptor::new("gh", "GitHub", "create_issue"));

    let result = server
        .handle("inspect", json!({"name": "gitHubCreateIssue"}))
        .await;
    assert!(!result.is_error, "{:?}", result.first_text());
    assert_eq!(registry.lists(), 2);
}

#[tokio::test]
async fn unknown_tools_are_not_found_after_one_retry() {
    let (registry, server) = setup();
    let result = server.handle("invoke", json!({"name": "nope"})).await;
    assert!(result.is_error);
    assert_eq!(result.first_text(), Some("tool not found: nope"));
    assert_eq!(registry.lists(), 2);
    assert!(registry.calls().is_empty());
}

#[tokio::test]
async fn cold_lookups_do_not_refresh_twice() {
    let (registry, server) = setup();
    let result = server.handle("inspect", json!({"name": "nope"})).await;
    assert_eq!(result.first_text(), Some("tool not found: nope"));
    assert_eq!(registry.lists(), 1);

    server.catalog().invalidate();
    let result = server.handle("inspect", json!({"name": "stillNope"})).await;
    assert!(result.is_error);
    assert_eq!(registry.lists(), 2);
}

#[tokio::test]
async fn inspect_renders_a_stub() {
    let (_, server) = setup();
    let result = server
        .handle("inspect", json!({"name": "slackPostMessage"}))
        .await;
    assert_eq!(
        result.first_text(),
        Some(
            "// Post a message\n\
             // id: slack__post_message (provider: Slack)\n\
             await mcp.callTool(\"slackPostMessage\", { text: string, channel: string })"
        )
    );

    let by_id = server
        .handle("inspect", json!({"name": "slack__post_message"}))
        .await;
    assert_eq!(by_id, result);
}

#[tokio::test]
async fn invoke_returns_text() {
    let (registry, server) = setup();
    let result = server
        .handle(
            "invoke",
            json!({"name": "gitHubSearchRepos_2", "params": {"query": "tokio"}}),
        )
        .await;
    assert!(!result.is_error);
    assert_eq!(body(&result), json!({"total": 2, "query": "tokio"}));

    let plain = server
        .handle("invoke", json!({"name": "gh__searchRepos"}))
        .await;
    assert_eq!(plain.first_text(), Some("plain text answer"));

    let calls = registry.calls();
    assert_eq!(calls[0].1, json!({"query": "tokio"}));
    assert_eq!(calls[0].2, None);
    assert_eq!(calls[1].1, json!({}));
}

#[tokio::test]
async fn provider_errors_keep_their_text() {
    let (_, server) = setup();
    let result = server
        .handle("invoke", json!({"name": "slackPostMessage", "params": {"text": "hi"}}))
        .await;
    assert!(result.is_error);
    assert_eq!(result.first_text(), Some("channel_not_found"));
}

#[tokio::test]
async fn bad_requests_fail_before_the_catalog() {
    let (registry, server) = setup();
    let unknown = server.handle("explode", json!({})).await;
    assert!(unknown.is_error);
    assert_eq!(
        unknown.first_text(),
        Some("invalid argument: unknown operation: explode")
    );

    for (op, args) in [
        ("inspect", json!({})),
        ("invoke", json!({"params": {}})),
        ("orchestrate", json!({})),
    ] {
        let result = server.handle(op, args).await;
        assert!(result.is_error, "{op}");
        assert!(result.first_text().unwrap().contains("missing required argument"));
    }
    assert_eq!(registry.lists(), 0);
}

#[tokio::test]
async fn orchestrate_reports_results_and_errors() {
    let (_, server) = setup();
    let ok = server
        .handle("orchestrate", json!({"code": "return 1 + 1"}))
        .await;
    assert!(!ok.is_error);
    assert_eq!(body(&ok), json!({"result": 2, "logs": [], "isError": false}));

    let thrown = server
        .handle("orchestrate", json!({"code": "throw new Error('x')"}))
        .await;
    assert!(thrown.is_error);
    assert_eq!(body(&thrown), json!({"error": "x", "logs": [], "isError": true}));
}

#[tokio::test]
async fn orchestrate_chains_tools_with_fresh_call_ids() {
    let (registry, server) = setup();
    let result = server
        .handle(
            "orchestrate",
            json!({"code": r#"
                const repos = await mcp.callTool("gitHubSearchRepos_2", { query: "serde" });
                const text = await mcp.callTool("gh__searchRepos", {});
                mcp.log("info", "searched", { total: repos.total });
                try {
                    await mcp.callTool("slackPostMessage", { text });
                } catch (e) {
                    return { total: repos.total, text, failure: e.message };
                }
            "#}),
        )
        .await;
    assert!(!result.is_error, "{:?}", result.first_text());
    assert_eq!(
        body(&result)["result"],
        json!({"total": 2, "text": "plain text answer", "failure": "channel_not_found"})
    );
    assert_eq!(body(&result)["logs"], json!([r#"[info] searched {"total":2}"#]));

    let ids: Vec<String> = registry.calls().into_iter().filter_map(|c| c.2).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);
    assert!(registry.aborted().is_empty());
}

#[tokio::test]
async fn orchestrate_timeout_aborts_the_pending_call() {
    let (registry, server) = setup();
    let result = server
        .handle(
            "orchestrate",
            json!({"code": "await mcp.callTool('slow__wait', {}); return 'done';", "timeoutMs": 50}),
        )
        .await;
    assert!(result.is_error);
    assert_eq!(
        body(&result),
        json!({"error": "Execution timed out after 50ms", "logs": [], "isError": true})
    );

    // Aborts are dispatched on spawned tasks.
    for _ in 0..50 {
        if !registry.aborted().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let issued: Vec<String> = registry.calls().into_iter().filter_map(|c| c.2).collect();
    assert_eq!(issued.len(), 1);
    assert_eq!(registry.aborted(), issued);
}

#[tokio::test]
async fn orchestrate_timeout_is_capped() {
    let registry = FakeRegistry::new(catalog_tools());
    let catalog = Arc::new(ToolCatalog::new(registry));
    let server = MetaServer::with_options(
        catalog,
        MetaOptions {
            sandbox: SandboxOptions {
                timeout: Duration::from_secs(5),
                ..SandboxOptions::default()
            },
            max_timeout: Duration::from_millis(40),
        },
    );
    let result = server
        .handle(
            "orchestrate",
            json!({"code": "while (true) {}", "timeoutMs": 10_000}),
        )
        .await;
    assert_eq!(
        body(&result)["error"],
        "Execution timed out after 40ms"
    );
}
