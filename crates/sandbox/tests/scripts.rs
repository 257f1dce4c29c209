//! End-to-end script execution against an in-memory tool invoker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecutionResult, SandboxOptions, SandboxRuntime, ToolCallError, ToolInvoker};
use serde_json::{Value, json};

#[derive(Default)]
struct FakeTools {
    calls: Mutex<Vec<(String, Value, String)>>,
    aborted: Mutex<Vec<String>>,
}

impl FakeTools {
    fn calls(&self) -> Vec<(String, Value, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolInvoker for FakeTools {
    async fn call_tool(
        &self,
        name: &str,
        params: Value,
        call_id: &str,
    ) -> Result<Value, ToolCallError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), params.clone(), call_id.to_string()));
        match name {
            "echo" => Ok(params),
            "add" => {
                let a = params["a"].as_f64().unwrap_or(0.0);
                let b = params["b"].as_f64().unwrap_or(0.0);
                Ok(json!(a + b))
            }
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("late"))
            }
            "fail" => Err(ToolCallError("upstream exploded".into())),
            other => Err(ToolCallError(format!("tool not found: {other}"))),
        }
    }

    fn abort(&self, call_id: &str) {
        self.aborted.lock().unwrap().push(call_id.to_string());
    }
}

fn setup() -> (Arc<FakeTools>, SandboxRuntime) {
    let tools = Arc::new(FakeTools::default());
    let runtime = SandboxRuntime::new(tools.clone());
    (tools, runtime)
}

async fn run(code: &str) -> ExecutionResult {
    let (_, runtime) = setup();
    runtime.execute(code).await
}

#[tokio::test]
async fn arithmetic_result() {
    let result = run("return 1 + 1").await;
    assert_eq!(result.result, Some(json!(2)));
    assert!(!result.is_error);
    assert!(result.logs.is_empty());
}

#[tokio::test]
async fn thrown_error_message_becomes_error() {
    let result = run("throw new Error('x')").await;
    assert!(result.is_error);
    assert_eq!(result.error.as_deref(), Some("x"));
    assert_eq!(result.result, None);
}

#[tokio::test]
async fn thrown_strings_are_reported_verbatim() {
    let result = run("throw 'plain failure'").await;
    assert_eq!(result.error.as_deref(), Some("plain failure"));
}

#[tokio::test]
async fn tool_results_are_chained() {
    let (tools, runtime) = setup();
    let result = runtime
        .execute(
            r#"
            const first = await mcp.callTool("add", { a: 2, b: 3 });
            const second = await mcp.callTool("add", { a: first, b: 10 });
            return { first, second };
            "#,
        )
        .await;
    assert_eq!(result.result, Some(json!({"first": 5, "second": 15})));

    let calls = tools.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, json!({"a": 5, "b": 10}));
    assert_ne!(calls[0].2, calls[1].2, "each call gets its own correlation id");
    assert!(tools.aborted().is_empty());
}

#[tokio::test]
async fn uncaught_tool_failure_stops_the_script() {
    let (tools, runtime) = setup();
    let result = runtime
        .execute(
            r#"
            await mcp.callTool("fail", {});
            await mcp.callTool("echo", {});
            "#,
        )
        .await;
    assert_eq!(result.error.as_deref(), Some("upstream exploded"));
    assert_eq!(tools.calls().len(), 1);
}

#[tokio::test]
async fn caught_tool_failure_continues() {
    let result = run(
        r#"
        try {
            await mcp.callTool("fail", {});
        } catch (err) {
            return `recovered: ${err.message}`;
        }
        "#,
    )
    .await;
    assert_eq!(result.result, Some(json!("recovered: upstream exploded")));
}

#[tokio::test]
async fn settle_reports_each_outcome() {
    let result = run(
        r#"
        const results = await settle(Promise.resolve(1), Promise.reject(new Error('fail')));
        return results.map(r => r.status);
        "#,
    )
    .await;
    assert_eq!(result.result, Some(json!(["fulfilled", "rejected"])));
}

#[tokio::test]
async fn parallel_fails_fast() {
    let result = run(
        r#"
        const results = await parallel(Promise.resolve(1), Promise.reject(new Error('fail')));
        return results;
        "#,
    )
    .await;
    assert!(result.is_error);
    assert_eq!(result.error.as_deref(), Some("fail"));
}

#[tokio::test]
async fn parallel_accepts_an_array_of_tool_calls() {
    let (tools, runtime) = setup();
    let result = runtime
        .execute(
            r#"
            const inputs = [1, 2, 3];
            const sums = await parallel(inputs.map(n => mcp.callTool("add", { a: n, b: n })));
            return sums;
            "#,
        )
        .await;
    assert_eq!(result.result, Some(json!([2, 4, 6])));
    assert_eq!(tools.calls().len(), 3);
}

#[tokio::test]
async fn timeout_aborts_issued_calls() {
    let (tools, runtime) = setup();
    let result = runtime
        .execute_with_timeout(
            r#"
            mcp.log("info", "starting");
            await mcp.callTool("slow", {});
            return "unreachable";
            "#,
            Duration::from_millis(50),
        )
        .await;

    assert!(result.is_error);
    assert_eq!(
        result.error.as_deref(),
        Some("Execution timed out after 50ms")
    );
    assert_eq!(result.result, None);
    assert_eq!(result.logs, vec!["[info] starting"]);

    let calls = tools.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(tools.aborted(), vec![calls[0].2.clone()]);
}

#[tokio::test]
async fn unawaited_calls_are_aborted_when_the_script_returns() {
    let (tools, runtime) = setup();
    let result = runtime
        .execute(
            r#"
            const results = await settle(mcp.callTool("echo", { n: 1 }));
            return results[0].value.n;
            "#,
        )
        .await;
    assert_eq!(result.result, Some(json!(1)));
    assert!(tools.aborted().is_empty());

    let result = runtime
        .execute(
            r#"
            try {
                await parallel(mcp.callTool("slow", {}), mcp.callTool("fail", {}));
            } catch (err) {
                return err.message;
            }
            "#,
        )
        .await;
    assert_eq!(result.result, Some(json!("upstream exploded")));
    let slow = tools
        .calls()
        .into_iter()
        .find(|(name, _, _)| name == "slow")
        .map(|(_, _, id)| id)
        .expect("slow call was dispatched");
    assert_eq!(tools.aborted(), vec![slow]);
}

#[tokio::test]
async fn logs_are_formatted_and_capped() {
    let tools = Arc::new(FakeTools::default());
    let runtime = SandboxRuntime::with_options(
        tools,
        SandboxOptions {
            max_log_entries: 3,
            ..SandboxOptions::default()
        },
    );
    let result = runtime
        .execute(
            r#"
            for (let i = 0; i < 5; i++) {
                console.log("item", i, { even: i % 2 === 0 });
            }
            mcp.log("warn", "done", { count: 5 });
            "#,
        )
        .await;
    assert_eq!(
        result.logs,
        vec![
            r#"[log] item 3 {"even":false}"#,
            r#"[log] item 4 {"even":true}"#,
            r#"[warn] done {"count":5}"#,
        ]
    );
}

#[tokio::test]
async fn logs_survive_a_throw() {
    let result = run(
        r#"
        console.warn("before");
        null.boom;
        "#,
    )
    .await;
    assert_eq!(result.logs, vec!["[warn] before"]);
    assert_eq!(
        result.error.as_deref(),
        Some("Cannot read properties of null (reading 'boom')")
    );
}

#[tokio::test]
async fn scripts_cannot_see_host_globals() {
    let result = run("return typeof process + ',' + typeof require + ',' + typeof fetch").await;
    assert_eq!(result.result, Some(json!("undefined,undefined,undefined")));
}

#[tokio::test]
async fn each_execution_gets_fresh_globals() {
    let (_, runtime) = setup();
    runtime.execute("var leaked = 1;").await;
    let result = runtime.execute("return typeof leaked").await;
    assert_eq!(result.result, Some(json!("undefined")));
}

#[tokio::test]
async fn language_surface() {
    let result = run(
        r#"
        const { items = [], meta: { page } } = { items: [3, 1, 2], meta: { page: 4 } };
        const [head, ...tail] = [...items].sort((a, b) => a - b);
        const words = "alpha,beta,gamma".split(",").map(w => w.toUpperCase());
        let total = 0;
        for (const n of items) {
            if (n === 1) continue;
            total += n;
        }
        let i = 0;
        while (true) {
            if (++i >= 3) break;
        }
        async function double(x) {
            return x * 2;
        }
        const doubled = await Promise.all([1, 2].map(double));
        return {
            head,
            tail,
            page,
            total,
            i,
            words: words.join("|"),
            doubled,
            fixed: (2 / 3).toFixed(2),
            nullish: null ?? "fallback",
            optional: items?.missing?.deep,
            json: JSON.parse(JSON.stringify({ a: [1, { b: true }] })),
            keys: Object.keys({ x: 1, y: 2 }),
            max: Math.max(...items),
            padded: "7".padStart(3, "0"),
            template: `page ${page} of ${items.length}`,
        };
        "#,
    )
    .await;
    assert_eq!(result.error, None);
    assert_eq!(
        result.result,
        Some(json!({
            "head": 1,
            "tail": [2, 3],
            "page": 4,
            "total": 5,
            "i": 3,
            "words": "ALPHA|BETA|GAMMA",
            "doubled": [2, 4],
            "fixed": "0.67",
            "nullish": "fallback",
            "json": {"a": [1, {"b": true}]},
            "keys": ["x", "y"],
            "max": 3,
            "padded": "007",
            "template": "page 4 of 3",
        }))
    );
}

#[tokio::test]
async fn closures_capture_per_iteration_bindings() {
    let result = run(
        r#"
        const fns = [];
        for (let i = 0; i < 3; i++) {
            fns.push(() => i);
        }
        return fns.map(f => f());
        "#,
    )
    .await;
    assert_eq!(result.result, Some(json!([0, 1, 2])));
}

#[tokio::test]
async fn const_reassignment_throws() {
    let result = run("const a = 1; a = 2;").await;
    assert_eq!(result.error.as_deref(), Some("Assignment to constant variable."));
}

#[tokio::test]
async fn runaway_recursion_is_a_range_error() {
    let result = run("function f(n) { return f(n + 1); } return f(0);").await;
    assert_eq!(
        result.error.as_deref(),
        Some("Maximum call stack size exceeded")
    );
}

#[tokio::test]
async fn finally_runs_after_throw() {
    let result = run(
        r#"
        const seen = [];
        try {
            try {
                throw new TypeError("inner");
            } finally {
                seen.push("finally");
            }
        } catch (e) {
            seen.push(`${e.name}: ${e.message}`);
        }
        return seen;
        "#,
    )
    .await;
    assert_eq!(result.result, Some(json!(["finally", "TypeError: inner"])));
}

#[tokio::test]
async fn promise_then_and_catch() {
    let result = run(
        r#"
        const a = await Promise.resolve(2).then(x => x * 10);
        const b = await Promise.reject(new Error("no")).catch(e => e.message + "!");
        return [a, b];
        "#,
    )
    .await;
    assert_eq!(result.result, Some(json!([20, "no!"])));
}
