//! Cancellation through a real stdio provider.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gateway::{McpRegistry, MetaServer, ProviderConfig, ProviderRegistry, ToolCatalog};
use mcp::ServerConfig;
use serde_json::{Value, json};

/// A provider that never answers `hang`, fails `fail` at once, and appends
/// every `tools/call` and `notifications/cancelled` line to `$CALL_LOG`.
const PROVIDER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([^,}]*\).*/\1/p')
  case "$line" in
    *'"notifications/cancelled"'*)
      printf '%s\n' "$line" >> "$CALL_LOG" ;;
    *'"initialize"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{\"tools\":{}},\"serverInfo\":{\"name\":\"fake\"}}}" ;;
    *'"tools/list"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"hang\"},{\"name\":\"fail\"}]}}" ;;
    *'"tools/call"'*)
      printf '%s\n' "$line" >> "$CALL_LOG"
      case "$line" in
        *'"name":"fail"'*)
          echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"boom\"}],\"isError\":true}}" ;;
      esac ;;
  esac
done
"#;

struct Fixture {
    registry: Arc<McpRegistry>,
    server: MetaServer,
    log: PathBuf,
}

async fn connect(name: &str) -> Fixture {
    let log = std::env::temp_dir().join(format!("switchboard-{name}-{}.log", std::process::id()));
    let _ = std::fs::remove_file(&log);

    let mut config = ServerConfig::new("fake", "sh").with_args(["-c", PROVIDER]);
    config.env.insert("CALL_LOG".into(), log.display().to_string());
    config.timeout = Duration::from_secs(5);

    let registry = Arc::new(McpRegistry::new());
    registry
        .connect(ProviderConfig::new("fake", "Fake", config))
        .await
        .unwrap();
    let catalog = Arc::new(ToolCatalog::new(registry.clone()));
    let server = MetaServer::new(catalog);
    Fixture {
        registry,
        server,
        log,
    }
}

/// Logged messages, split into (called tool name, call id) and cancelled ids.
fn read_log(log: &Path) -> (Vec<(String, Value)>, Vec<Value>) {
    let content = std::fs::read_to_string(log).unwrap_or_default();
    let mut calls = Vec::new();
    let mut cancelled = Vec::new();
    for line in content.lines() {
        let message: Value = serde_json::from_str(line).unwrap();
        match message["method"].as_str() {
            Some("tools/call") => calls.push((
                message["params"]["name"].as_str().unwrap().to_string(),
                message["id"].clone(),
            )),
            Some("notifications/cancelled") => {
                cancelled.push(message["params"]["requestId"].clone())
            }
            _ => {}
        }
    }
    (calls, cancelled)
}

async fn wait_for_cancellations(log: &Path, count: usize) -> (Vec<(String, Value)>, Vec<Value>) {
    for _ in 0..100 {
        let seen = read_log(log);
        if seen.1.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    read_log(log)
}

#[tokio::test]
async fn timeout_cancels_the_call_at_the_provider() {
    let fixture = connect("timeout").await;
    let result = fixture
        .server
        .handle(
            "orchestrate",
            json!({"code": "return await mcp.callTool('fake__hang', {})", "timeoutMs": 300}),
        )
        .await;
    assert!(result.is_error);
    assert!(result.first_text().unwrap().contains("Execution timed out after 300ms"));

    let (calls, cancelled) = wait_for_cancellations(&fixture.log, 1).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(cancelled, vec![calls[0].1.clone()]);

    // The abort consumed the record; a second one finds nothing.
    let call_id = calls[0].1.as_str().unwrap();
    assert!(!fixture.registry.abort(call_id).await);

    fixture.registry.shutdown().await;
    let _ = std::fs::remove_file(&fixture.log);
}

#[tokio::test]
async fn fail_fast_cancels_the_sibling_call() {
    let fixture = connect("parallel").await;
    let result = fixture
        .server
        .handle(
            "orchestrate",
            json!({"code": r#"
                try {
                    await parallel(mcp.callTool("fake__hang", {}), mcp.callTool("fake__fail", {}));
                } catch (e) {
                    return e.message;
                }
            "#}),
        )
        .await;
    assert!(!result.is_error, "{:?}", result.first_text());

    let (calls, cancelled) = wait_for_cancellations(&fixture.log, 1).await;
    let hang = calls
        .iter()
        .find(|(name, _)| name == "hang")
        .map(|(_, id)| id.clone())
        .expect("hang call reached the provider");
    assert_eq!(calls.len(), 2);
    assert_eq!(cancelled, vec![hang]);

    fixture.registry.shutdown().await;
    let _ = std::fs::remove_file(&fixture.log);
}

#[tokio::test]
async fn completed_calls_are_not_abortable() {
    let fixture = connect("completed").await;
    let result = fixture
        .registry
        .call_by_id("fake__fail", json!({}), Some("call-done"))
        .await
        .unwrap();
    assert!(result.is_error);
    assert!(!fixture.registry.abort("call-done").await);

    let (_, cancelled) = read_log(&fixture.log);
    assert!(cancelled.is_empty());

    fixture.registry.shutdown().await;
    let _ = std::fs::remove_file(&fixture.log);
}
