//! HTTP surface tests: the submit/poll query contract, knowledge-base
//! upload and ask, and the tool-registry endpoints, all against a running
//! API server with the mock LLM behind it.

use std::sync::Arc;
use std::time::Duration;

use insight_engine::core::bus::InProcessBus;
use insight_engine::core::kb::vector::SqliteVectorStore;
use insight_engine::core::kb::KbIngestor;
use insight_engine::core::lifecycle::LifecycleComponent;
use insight_engine::core::llm::mock::MockLlmClient;
use insight_engine::core::llm::LlmClient;
use insight_engine::core::registry::ToolRegistry;
use insight_engine::core::saga::state_store::SqliteSagaStore;
use insight_engine::core::saga::worker::{spawn_stage_workers, WorkerContext};
use insight_engine::interfaces::web::{ApiServer, ApiServerConfig};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Boot the whole daemon wiring minus the real LLM and tool servers.
async fn start_daemon() -> (String, Arc<ToolRegistry>) {
    let llm: Arc<dyn LlmClient> =
        Arc::new(MockLlmClient::deterministic().with_dimension(64));
    let store = Arc::new(SqliteSagaStore::open_in_memory().unwrap());
    let vectors = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
    let bus = Arc::new(InProcessBus::new());
    let registry = Arc::new(ToolRegistry::new(reqwest::Client::new()));

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        bus: bus.clone(),
        llm: llm.clone(),
        resolver: registry.clone(),
        http: reqwest::Client::new(),
    });
    spawn_stage_workers(ctx, 1);
    KbIngestor::new(bus.clone(), llm.clone(), vectors.clone()).spawn();

    let port = free_port().await;
    let mut server = ApiServer::new(ApiServerConfig {
        store,
        bus,
        llm,
        vectors,
        registry: registry.clone(),
        api_host: "127.0.0.1".to_string(),
        api_port: port,
    });
    server.on_start().await.unwrap();

    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("{base}/health"))
            .timeout(Duration::from_millis(200))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
        {
            return (base, registry);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("API server did not come up");
}

#[tokio::test]
async fn submit_returns_202_and_status_is_pollable() {
    let (base, _registry) = start_daemon().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/api/tenants/acme/query"))
        .json(&serde_json::json!({ "question": "what is the weather" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 202);
    let body: serde_json::Value = res.json().await.unwrap();
    let saga_id = body["saga_id"].as_str().unwrap().to_string();
    assert!(!saga_id.is_empty());

    // The weather question terminates as an irrelevant refusal without any
    // live tool servers, so the saga reaches a terminal state quickly.
    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        let res = client
            .get(format!("{base}/api/query/{saga_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        last = res.json().await.unwrap();
        if last["status"] == "error" || last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(last["status"], "error");
    assert_eq!(last["result"]["is_irrelevant"], true);
    assert_eq!(
        last["result"]["formatted_response"],
        "The question is not about your database."
    );
    // Worker-internal bookkeeping stays internal.
    assert!(last["result"].get("retry_budget").is_none());
}

#[tokio::test]
async fn empty_questions_are_rejected() {
    let (base, _registry) = start_daemon().await;
    let res = reqwest::Client::new()
        .post(format!("{base}/api/tenants/acme/query"))
        .json(&serde_json::json!({ "question": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
}

#[tokio::test]
async fn unknown_saga_ids_return_not_found() {
    let (base, _registry) = start_daemon().await;
    let res = reqwest::Client::new()
        .get(format!("{base}/api/query/no-such-saga"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
}

#[tokio::test]
async fn kb_upload_then_ask_round_trips() {
    let (base, _registry) = start_daemon().await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::text(
            "Revenue is quantity times price. Churn means inactive for thirty days.",
        )
        .file_name("definitions.txt"),
    );
    let res = client
        .post(format!("{base}/api/tenants/acme/kb/upload"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 202);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["file_id"].as_str().is_some());

    // Ingestion is asynchronous; poll the ask endpoint until context shows.
    let mut answered = None;
    for _ in 0..100 {
        let res = client
            .post(format!("{base}/api/kb/ask"))
            .json(&serde_json::json!({ "tenant_id": "acme", "query": "how is revenue defined?" }))
            .send()
            .await
            .unwrap();
        if res.status().is_success() {
            answered = Some(res.json::<serde_json::Value>().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let answer = answered.expect("document was never indexed");
    assert!(!answer["answer"].as_str().unwrap().is_empty());
    assert!(!answer["context"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn ask_without_documents_reports_no_context() {
    let (base, _registry) = start_daemon().await;
    let res = reqwest::Client::new()
        .post(format!("{base}/api/kb/ask"))
        .json(&serde_json::json!({ "tenant_id": "empty-tenant", "query": "anything" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "NoContextAvailable");
}

#[tokio::test]
async fn registry_endpoints_register_and_list() {
    let (base, _registry) = start_daemon().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/register"))
        .json(&serde_json::json!({
            "role": "database",
            "endpoint": "http://db-tools:8001",
            "capabilities": ["execute_sql", "list_tables"]
        }))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());

    let servers: serde_json::Value = client
        .get(format!("{base}/servers"))
        .query(&[("role", "database")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = servers.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["endpoint"], "http://db-tools:8001");
    assert_eq!(list[0]["status"], "healthy");

    let other: serde_json::Value = client
        .get(format!("{base}/servers"))
        .query(&[("role", "knowledge-base")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(other.as_array().unwrap().is_empty());
}
