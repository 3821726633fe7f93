// crates/wfnodes/tests/nodes_test.rs

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wfcore::{
    Connection, ExecutionRequest, FailureKind, NodeSpec, NodeStatus, RunStatus, SkipReason,
    Workflow, WorkflowError, GLOBAL_NAMESPACE,
};
use wfnodes::{register_all, standard_registry};
use wfruntime::{FlowRuntime, NodeRegistry};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

fn runtime() -> FlowRuntime {
    init_tracing();
    FlowRuntime::new(Arc::new(standard_registry().unwrap()))
}

fn manual() -> NodeSpec {
    NodeSpec::new("Start", "trigger.manual")
}

#[test]
fn test_register_all_standard_nodes() {
    let registry = standard_registry().unwrap();
    let types = registry.list_node_types();

    for expected in [
        "debug.log",
        "flow.if",
        "flow.stop_and_error",
        "http.request",
        "static.set",
        "time.delay",
        "transform.jmespath",
        "transform.json_parse",
        "transform.json_stringify",
        "transform.set",
        "trigger.manual",
        "trigger.poll",
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {}", expected);
    }
    assert!(registry.describe("trigger.manual").unwrap().is_trigger());
    assert!(registry.describe("trigger.poll").unwrap().is_poll());
    assert!(registry.describe("http.request").unwrap().rate_limit.is_some());
}

#[test]
fn test_register_all_twice_fails() {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry).unwrap();
    assert!(matches!(
        register_all(&mut registry),
        Err(WorkflowError::DuplicateType(_))
    ));
}

#[tokio::test]
async fn test_poll_trigger_advances_cursor_between_runs() {
    let runtime = runtime();
    let mut wf = Workflow::new("poller");
    wf.add_node(NodeSpec::new("Poll", "trigger.poll").with_parameter("step", 5)).unwrap();
    wf.add_node(NodeSpec::new("Log", "debug.log").with_parameter("message", "tick")).unwrap();
    wf.connect("Poll", "Log").unwrap();

    let first = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();
    assert_eq!(first.start_node.as_deref(), Some("Poll"));
    assert_eq!(first.output("Log"), Some(&json!({"cursor": 5, "previous": 0})));

    let second = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();
    assert_eq!(second.output("Poll"), Some(&json!({"cursor": 10, "previous": 5})));
    assert_eq!(wf.get_static_data("node:Poll")["cursor"], json!(10));
}

#[tokio::test]
async fn test_poll_cursor_overflow_fails_without_moving() {
    let runtime = runtime();
    let mut wf = Workflow::new("overflow");
    wf.add_node(NodeSpec::new("Poll", "trigger.poll")).unwrap();
    wf.set_static_data("node:Poll", json!({"cursor": i64::MAX}).as_object().unwrap().clone());

    let record = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();

    let poll = record.node("Poll").unwrap();
    assert_eq!(poll.status, NodeStatus::Failed);
    assert_eq!(poll.error.as_ref().unwrap().kind, FailureKind::ExecutionFailed);
    assert_eq!(wf.get_static_data("node:Poll")["cursor"], json!(i64::MAX));
}

#[tokio::test]
async fn test_if_routes_by_comparison() {
    let runtime = runtime();
    let mut wf = Workflow::new("router");
    wf.add_node(manual()).unwrap();
    wf.add_node(
        NodeSpec::new("Check", "flow.if")
            .with_parameter("left", "{{ $json.n }}")
            .with_parameter("right", 3)
            .with_parameter("operation", "gt"),
    )
    .unwrap();
    wf.add_node(NodeSpec::new("Big", "transform.set").with_parameter("values", json!({"size": "big"})))
        .unwrap();
    wf.add_node(
        NodeSpec::new("Small", "transform.set").with_parameter("values", json!({"size": "small"})),
    )
    .unwrap();
    wf.connect("Start", "Check").unwrap();
    wf.add_connection(Connection::main("Check", "Big").from_output(0)).unwrap();
    wf.add_connection(Connection::main("Check", "Small").from_output(1)).unwrap();

    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"n": 5})))
        .await
        .unwrap();
    assert_eq!(record.output("Big"), Some(&json!({"n": 5, "size": "big"})));
    assert_eq!(record.node("Small").unwrap().skip_reason, Some(SkipReason::BranchNotTaken));
    assert_eq!(record.status, RunStatus::Finished);

    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(record.output("Small"), Some(&json!({"n": 1, "size": "small"})));
    assert_eq!(record.node_status("Big"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_unknown_if_operation_fails_the_node() {
    let runtime = runtime();
    let mut wf = Workflow::new("bad if");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Check", "flow.if").with_parameter("operation", "matches")).unwrap();
    wf.connect("Start", "Check").unwrap();

    let record = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();
    let check = record.node("Check").unwrap();
    assert_eq!(check.error.as_ref().unwrap().kind, FailureKind::InvalidParameters);
}

#[tokio::test]
async fn test_set_without_input() {
    let runtime = runtime();
    let mut wf = Workflow::new("set");
    wf.add_node(manual()).unwrap();
    wf.add_node(
        NodeSpec::new("Set", "transform.set")
            .with_parameter("values", json!({"greeting": "hi {{ $json.name }}"}))
            .with_parameter("keep_input", false),
    )
    .unwrap();
    wf.connect("Start", "Set").unwrap();

    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"name": "Lin"})))
        .await
        .unwrap();
    assert_eq!(record.output("Set"), Some(&json!({"greeting": "hi Lin"})));
}

#[tokio::test]
async fn test_json_stringify_then_parse() {
    let runtime = runtime();
    let mut wf = Workflow::new("json");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Encode", "transform.json_stringify")).unwrap();
    wf.add_node(NodeSpec::new("Decode", "transform.json_parse").with_parameter("json", "{{ $json.json }}"))
        .unwrap();
    wf.connect("Start", "Encode").unwrap();
    wf.connect("Encode", "Decode").unwrap();

    let input = json!({"items": [1, 2, 3], "ok": true});
    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(input.clone()))
        .await
        .unwrap();

    assert_eq!(
        record.output("Encode"),
        Some(&json!({"json": r#"{"items":[1,2,3],"ok":true}"#}))
    );
    assert_eq!(record.output("Decode"), Some(&input));
}

#[tokio::test]
async fn test_json_parse_rejects_bad_text() {
    let runtime = runtime();
    let mut wf = Workflow::new("bad json");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Decode", "transform.json_parse").with_parameter("json", "{nope"))
        .unwrap();
    wf.connect("Start", "Decode").unwrap();

    let record = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();
    let decode = record.node("Decode").unwrap();
    assert_eq!(decode.error.as_ref().unwrap().kind, FailureKind::ExecutionFailed);
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_stop_and_error_feeds_error_branch() {
    let runtime = runtime();
    let mut wf = Workflow::new("errors");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Stop", "flow.stop_and_error").with_parameter("message", "boom"))
        .unwrap();
    wf.add_node(
        NodeSpec::new("Handle", "transform.set").with_parameter("values", json!({"handled": true})),
    )
    .unwrap();
    wf.connect("Start", "Stop").unwrap();
    wf.add_connection(Connection::error("Stop", "Handle")).unwrap();

    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"id": 1})))
        .await
        .unwrap();

    let handled = record.output("Handle").unwrap();
    assert_eq!(handled["handled"], json!(true));
    assert_eq!(handled["node"], json!("Stop"));
    assert!(handled["error"]["message"].as_str().unwrap().contains("boom"));
    assert_eq!(handled["input"], json!({"id": 1}));
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_static_set_is_visible_next_run() {
    let runtime = runtime();
    let mut wf = Workflow::new("remember");
    wf.add_node(manual()).unwrap();
    wf.add_node(
        NodeSpec::new("Last", "debug.log").with_parameter("message", "last seen {{ $static.global.seen }}"),
    )
    .unwrap();
    wf.add_node(
        NodeSpec::new("Remember", "static.set").with_parameter("values", json!({"seen": "{{ $json.id }}"})),
    )
    .unwrap();
    wf.connect("Start", "Last").unwrap();
    wf.connect("Last", "Remember").unwrap();

    let first = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"id": 7})))
        .await
        .unwrap();
    assert!(first.static_data_changed);
    assert_eq!(first.output("Remember"), Some(&json!({"id": 7})));
    assert_eq!(wf.get_static_data(GLOBAL_NAMESPACE)["seen"], json!(7));

    let second = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"id": 8})))
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Finished);
    assert_eq!(wf.get_static_data(GLOBAL_NAMESPACE)["seen"], json!(8));
}

#[tokio::test]
async fn test_delay_is_cancellable() {
    let runtime = runtime();
    let mut wf = Workflow::new("slow");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Wait", "time.delay").with_parameter("delay_ms", 10_000)).unwrap();
    wf.connect("Start", "Wait").unwrap();

    let handle = runtime.start(Arc::new(wf), ExecutionRequest::manual());
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let record = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("delay should stop on cancel")
        .unwrap();
    assert_eq!(record.status, RunStatus::Canceled);
    assert_eq!(
        record.node("Wait").unwrap().error.as_ref().unwrap().kind,
        FailureKind::Cancelled
    );
}

#[tokio::test]
async fn test_delay_passes_input_through() {
    let runtime = runtime();
    let mut wf = Workflow::new("short");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Wait", "time.delay").with_parameter("delay_ms", 10)).unwrap();
    wf.connect("Start", "Wait").unwrap();

    let record = runtime
        .execute(&wf, ExecutionRequest::manual().with_input(json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(record.output("Wait"), Some(&json!({"x": 1})));
}

#[tokio::test]
async fn test_http_request_requires_url() {
    let runtime = runtime();
    let mut wf = Workflow::new("http");
    wf.add_node(manual()).unwrap();
    wf.add_node(NodeSpec::new("Call", "http.request")).unwrap();
    wf.connect("Start", "Call").unwrap();

    let result = runtime.execute(&wf, ExecutionRequest::manual()).await;
    assert!(matches!(
        result,
        Err(wfcore::FlowError::Workflow(WorkflowError::InvalidDefinition(_)))
    ));
}

#[tokio::test]
async fn test_http_request_rejects_unknown_method() {
    let runtime = runtime();
    let mut wf = Workflow::new("http");
    wf.add_node(manual()).unwrap();
    wf.add_node(
        NodeSpec::new("Call", "http.request")
            .with_parameter("url", "http://localhost:1/never")
            .with_parameter("method", "TRACE"),
    )
    .unwrap();
    wf.connect("Start", "Call").unwrap();

    let record = runtime.execute(&wf, ExecutionRequest::manual()).await.unwrap();
    let call = record.node("Call").unwrap();
    assert_eq!(call.status, NodeStatus::Failed);
    assert_eq!(call.error.as_ref().unwrap().kind, FailureKind::InvalidParameters);
    assert_eq!(call.attempts, 0);
}

/// Runs a single `transform.jmespath` node over `input`.
async fn run_query(node: NodeSpec, input: serde_json::Value) -> wfcore::ExecutionRecord {
    let runtime = runtime();
    let mut wf = Workflow::new("query");
    wf.add_node(manual()).unwrap();
    wf.add_node(node).unwrap();
    wf.connect("Start", "Query").unwrap();
    runtime
        .execute(&wf, ExecutionRequest::manual().with_input(input))
        .await
        .unwrap()
}

fn query() -> NodeSpec {
    NodeSpec::new("Query", "transform.jmespath")
}

#[tokio::test]
async fn test_query_input_path_only() {
    let record = run_query(
        query().with_parameter("input_path", "body"),
        json!({
            "body": {"city": "New York", "temperature": 28},
            "user": {"name": "Alice"}
        }),
    )
    .await;

    assert_eq!(
        record.output("Query"),
        Some(&json!({"city": "New York", "temperature": 28}))
    );
}

#[tokio::test]
async fn test_query_parameters_override_selected_fields() {
    let record = run_query(
        query()
            .with_parameter("input_path", "body")
            .with_parameter("parameters", json!({"info": "is a great city", "temperature": 30})),
        json!({"body": {"city": "Los Angeles", "temperature": 26}}),
    )
    .await;

    assert_eq!(
        record.output("Query"),
        Some(&json!({"city": "Los Angeles", "temperature": 30, "info": "is a great city"}))
    );
}

#[tokio::test]
async fn test_query_result_path_embeds_into_input() {
    let record = run_query(
        query()
            .with_parameter("input_path", "body")
            .with_parameter("parameters", json!({"note": "cool city"}))
            .with_parameter("result_path", "body.transformed"),
        json!({"body": {"city": "Chicago", "temperature": 20}}),
    )
    .await;

    assert_eq!(
        record.output("Query"),
        Some(&json!({
            "body": {
                "city": "Chicago",
                "temperature": 20,
                "transformed": {"city": "Chicago", "temperature": 20, "note": "cool city"}
            }
        }))
    );
}

#[tokio::test]
async fn test_query_full_pipeline() {
    let record = run_query(
        query()
            .with_parameter("input_path", "body")
            .with_parameter("parameters", json!({"info": "rainy city"}))
            .with_parameter("result_path", "body.transformed")
            .with_parameter("output_path", "body.transformed"),
        json!({
            "body": {"city": "Seattle", "temperature": 12},
            "meta": {"timestamp": "2023-01-01T12:00:00Z"}
        }),
    )
    .await;

    assert_eq!(
        record.output("Query"),
        Some(&json!({"city": "Seattle", "temperature": 12, "info": "rainy city"}))
    );
}

#[tokio::test]
async fn test_query_output_path_with_functions() {
    let record = run_query(
        query().with_parameter("output_path", "split(' ', uppercase(body.city))"),
        json!({"body": {"city": "Boston harbor"}}),
    )
    .await;

    assert_eq!(record.output("Query"), Some(&json!(["BOSTON", "HARBOR"])));
}

#[tokio::test]
async fn test_query_rejects_invalid_expression() {
    let record = run_query(query().with_parameter("input_path", "body[?"), json!({})).await;

    let node = record.node("Query").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.error.as_ref().unwrap().kind, FailureKind::InvalidParameters);
    assert_eq!(node.attempts, 0);
}
