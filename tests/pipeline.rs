//! End-to-end saga pipeline tests: real workers over the in-process bus and
//! sqlite stores, a fake tool server speaking the tool protocol, and the
//! mock LLM driving the stage-1 tool loop.

use axum::{extract::State, routing::get, routing::post, Json, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use insight_engine::core::bus::{InProcessBus, MessageBus, TOPIC_QUERY_INITIATED};
use insight_engine::core::llm::mock::MockLlmClient;
use insight_engine::core::llm::{LlmClient, LlmOutput, ToolCall};
use insight_engine::core::registry::ToolRegistry;
use insight_engine::core::saga::state_store::{SagaStore, SqliteSagaStore};
use insight_engine::core::saga::worker::{spawn_stage_workers, Envelope, WorkerContext};
use insight_engine::core::saga::{SagaRecord, SagaStatus};

#[derive(Clone)]
struct ToolServerState {
    execute_calls: Arc<AtomicUsize>,
}

async fn call_tool(
    State(state): State<ToolServerState>,
    Json(request): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let name = request["name"].as_str().unwrap_or_default();
    let args = &request["arguments"];
    let response = match name {
        "list_tables" => serde_json::json!({ "content": "orders, products" }),
        "describe_table" => serde_json::json!({
            "content": "orders(id, customer, user_id, quantity, price)"
        }),
        "search_knowledge_base" => serde_json::json!({
            "content": "Revenue = SUM(quantity*price)"
        }),
        "execute_sql" => {
            state.execute_calls.fetch_add(1, Ordering::SeqCst);
            let sql = args["sql"].as_str().unwrap_or_default();
            if sql.contains("usr_id") {
                serde_json::json!({
                    "content": "column \"usr_id\" does not exist",
                    "is_error": true
                })
            } else {
                serde_json::json!({
                    "content": serde_json::json!({
                        "columns": ["customer", "total"],
                        "rows": [["acme", 120], ["globex", 90]]
                    })
                    .to_string()
                })
            }
        }
        other => serde_json::json!({
            "content": format!("unknown tool {other}"),
            "is_error": true
        }),
    };
    Json(response)
}

async fn start_tool_server() -> (String, Arc<AtomicUsize>) {
    let execute_calls = Arc::new(AtomicUsize::new(0));
    let state = ToolServerState {
        execute_calls: execute_calls.clone(),
    };
    let app = Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
        .route(
            "/list_tools",
            get(|| async {
                Json(serde_json::json!({
                    "tools": [
                        { "name": "list_tables", "description": "List tables", "inputSchema": {} },
                        { "name": "describe_table", "description": "Describe a table", "inputSchema": {} },
                        { "name": "execute_sql", "description": "Run a read-only query", "inputSchema": {} }
                    ]
                }))
            }),
        )
        .route("/call_tool", post(call_tool))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), execute_calls)
}

struct Harness {
    store: Arc<SqliteSagaStore>,
    bus: Arc<InProcessBus>,
    execute_calls: Arc<AtomicUsize>,
}

impl Harness {
    async fn start(llm: Arc<dyn LlmClient>) -> Self {
        let (endpoint, execute_calls) = start_tool_server().await;

        let registry = Arc::new(ToolRegistry::new(reqwest::Client::new()));
        registry.register("database", &endpoint, vec![]).await;
        registry.register("knowledge-base", &endpoint, vec![]).await;

        let store = Arc::new(SqliteSagaStore::open_in_memory().unwrap());
        let bus = Arc::new(InProcessBus::new());
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            bus: bus.clone(),
            llm,
            resolver: registry,
            http: reqwest::Client::new(),
        });
        spawn_stage_workers(ctx, 1);

        Self {
            store,
            bus,
            execute_calls,
        }
    }

    async fn submit(&self, saga_id: &str, question: &str) {
        let record = SagaRecord::new(saga_id.into(), "acme".into(), question.into());
        self.store.create(&record).await.unwrap();
        self.bus
            .publish(
                TOPIC_QUERY_INITIATED,
                serde_json::to_value(Envelope::new(saga_id, "acme")).unwrap(),
            )
            .await
            .unwrap();
    }

    async fn wait_terminal(&self, saga_id: &str) -> SagaRecord {
        for _ in 0..200 {
            if let Some(record) = self.store.get(saga_id).await.unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("saga {saga_id} did not reach a terminal state");
    }
}

fn sql_text(sql: &str) -> LlmOutput {
    LlmOutput {
        text: format!("Schema checked.\n\n```sql\n{sql}\n```"),
        tool_calls: Vec::new(),
        usage: None,
    }
}

fn plain_text(text: &str) -> LlmOutput {
    LlmOutput {
        text: text.to_string(),
        tool_calls: Vec::new(),
        usage: None,
    }
}

#[tokio::test]
async fn happy_path_runs_discovery_and_completes() {
    let harness = Harness::start(Arc::new(MockLlmClient::deterministic())).await;
    harness.submit("saga-happy", "top 5 customers by revenue").await;

    let record = harness.wait_terminal("saga-happy").await;
    assert_eq!(record.status, SagaStatus::Completed);
    assert!(record.generated_sql.as_deref().unwrap().contains("LIMIT 5"));
    assert!(record.raw_results.as_deref().unwrap().contains("| customer | total |"));
    assert!(!record.formatted_response.as_deref().unwrap().is_empty());
    assert!(!record.is_irrelevant);

    // Discovery actually walked the tools through the registry.
    let generate = record
        .call_stack
        .iter()
        .find(|s| s.step_name == "generate_query")
        .unwrap();
    let tools: Vec<&str> = generate
        .metadata
        .tools_used
        .iter()
        .map(|t| t.tool.as_str())
        .collect();
    assert!(tools.contains(&"list_tables"));
    assert!(tools.contains(&"describe_table"));
    assert!(tools.contains(&"search_knowledge_base"));
    assert!(generate.metadata.available_tables.is_some());

    let step_names: Vec<&str> = record
        .call_stack
        .iter()
        .map(|s| s.step_name.as_str())
        .collect();
    assert_eq!(
        step_names,
        vec!["generate_query", "execute_query", "format_results"]
    );
    assert_eq!(harness.execute_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn irrelevant_question_short_circuits_before_execution() {
    let harness = Harness::start(Arc::new(MockLlmClient::deterministic())).await;
    harness.submit("saga-weather", "what is the weather").await;

    let record = harness.wait_terminal("saga-weather").await;
    assert_eq!(record.status, SagaStatus::Error);
    assert!(record.is_irrelevant);
    assert_eq!(
        record.formatted_response.as_deref(),
        Some("The question is not about your database.")
    );
    assert_eq!(record.steps_named("execute_query"), 0);
    assert_eq!(record.steps_named("format_results"), 0);
    assert_eq!(harness.execute_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn execution_failure_self_corrects_once_then_completes() {
    let llm = MockLlmClient::scripted(vec![
        sql_text("SELECT usr_id, COUNT(*) FROM orders GROUP BY usr_id LIMIT 5"),
        sql_text("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id LIMIT 5"),
        plain_text("Your most active user leads with the highest order count."),
    ]);
    let harness = Harness::start(Arc::new(llm)).await;
    harness.submit("saga-correct", "most active users").await;

    let record = harness.wait_terminal("saga-correct").await;
    assert_eq!(record.status, SagaStatus::Completed);
    assert_eq!(record.steps_named("generate_query"), 2);
    assert_eq!(record.steps_named("execute_query"), 2);
    assert_eq!(record.steps_named("format_results"), 1);
    assert!(record.generated_sql.as_deref().unwrap().contains("user_id"));
    assert_eq!(harness.execute_calls.load(Ordering::SeqCst), 2);

    // The first execute step carries the database error that drove the
    // reflection re-entry.
    let first_execute = record
        .call_stack
        .iter()
        .find(|s| s.step_name == "execute_query")
        .unwrap();
    assert!(first_execute
        .metadata
        .error
        .as_deref()
        .unwrap()
        .contains("usr_id"));
}

#[tokio::test]
async fn second_execution_failure_exhausts_the_retry_budget() {
    let llm = MockLlmClient::scripted(vec![
        sql_text("SELECT usr_id FROM orders"),
        sql_text("SELECT usr_id FROM orders"),
    ]);
    let harness = Harness::start(Arc::new(llm)).await;
    harness.submit("saga-exhaust", "most active users").await;

    let record = harness.wait_terminal("saga-exhaust").await;
    assert_eq!(record.status, SagaStatus::Error);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("ExecutionFailed"));
    assert_eq!(record.steps_named("generate_query"), 2);
    assert_eq!(record.steps_named("execute_query"), 2);
    assert_eq!(record.retry_budget, 0);
}

#[tokio::test]
async fn unsafe_sql_never_reaches_the_database() {
    let llm = MockLlmClient::scripted(vec![sql_text("DELETE FROM orders")]);
    let harness = Harness::start(Arc::new(llm)).await;
    harness.submit("saga-unsafe", "clean up old orders").await;

    let record = harness.wait_terminal("saga-unsafe").await;
    assert_eq!(record.status, SagaStatus::Error);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("UnsafeStatement"));
    assert_eq!(record.steps_named("execute_query"), 0);
    assert_eq!(harness.execute_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn runaway_tool_looping_exhausts_the_iteration_budget() {
    let llm = MockLlmClient::repeating(LlmOutput {
        text: String::new(),
        tool_calls: vec![ToolCall {
            id: "c1".to_string(),
            name: "list_tables".to_string(),
            arguments: serde_json::json!({}),
        }],
        usage: None,
    });
    let harness = Harness::start(Arc::new(llm)).await;
    harness.submit("saga-loop", "top customers").await;

    let record = harness.wait_terminal("saga-loop").await;
    assert_eq!(record.status, SagaStatus::Error);
    assert_eq!(
        record.error_message.as_deref(),
        Some("IterationBudgetExceeded")
    );
    let generate = record
        .call_stack
        .iter()
        .find(|s| s.step_name == "generate_query")
        .unwrap();
    assert_eq!(generate.metadata.tools_used.len(), 8);
}

#[tokio::test]
async fn tool_servers_advertise_their_tools() {
    let (endpoint, _) = start_tool_server().await;
    let client =
        insight_engine::core::mcp::McpHttpClient::new(reqwest::Client::new(), endpoint);
    let tools = client.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"execute_sql"));
    assert!(names.contains(&"list_tables"));
}

#[tokio::test]
async fn terminal_status_matches_the_last_step_record() {
    let harness = Harness::start(Arc::new(MockLlmClient::deterministic())).await;
    harness.submit("saga-invariant", "top 5 customers by revenue").await;

    let record = harness.wait_terminal("saga-invariant").await;
    let last = record.call_stack.last().unwrap();
    match record.status {
        SagaStatus::Completed => {
            assert_eq!(last.status, insight_engine::core::saga::StepStatus::Success)
        }
        SagaStatus::Error => {
            assert_eq!(last.status, insight_engine::core::saga::StepStatus::Error)
        }
        other => panic!("not terminal: {other:?}"),
    }
    assert!(record.total_duration_ms >= record.call_stack.iter().map(|s| s.duration_ms).max().unwrap_or(0));
}
