use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use insight_engine::config::{BusBackend, Config};
use insight_engine::core::bus::InProcessBus;
use insight_engine::core::kb::vector::SqliteVectorStore;
use insight_engine::core::kb::KbIngestor;
use insight_engine::core::lifecycle::LifecycleManager;
use insight_engine::core::llm::http_provider::HttpLlmClient;
use insight_engine::core::llm::mock::MockLlmClient;
use insight_engine::core::llm::LlmClient;
use insight_engine::core::registry::client::{RegistryHttpClient, ToolResolver};
use insight_engine::core::registry::{spawn_maintenance, ToolRegistry};
use insight_engine::core::saga::state_store::SqliteSagaStore;
use insight_engine::core::saga::worker::{spawn_stage_workers, WorkerContext};
use insight_engine::interfaces::web::{ApiServer, ApiServerConfig};
use insight_engine::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let store = Arc::new(SqliteSagaStore::open(&config.saga_store_path())?);
    let vectors = Arc::new(SqliteVectorStore::open(&config.vector_store_path())?);
    let bus = match config.bus_backend() {
        Ok(BusBackend::InProcess) => Arc::new(InProcessBus::new()),
        Err(reason) => anyhow::bail!(reason),
    };
    let http = reqwest::Client::new();

    let llm: Arc<dyn LlmClient> = if config.mock_llm {
        warn!("MOCK_LLM is set: using deterministic canned responses");
        Arc::new(MockLlmClient::deterministic().with_dimension(config.embedding_dimension))
    } else {
        if config.llm_api_key.is_empty() {
            warn!("LLM_API_KEY is empty; model calls will be rejected upstream");
        }
        Arc::new(HttpLlmClient::new(
            config.llm_base_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.embed_model.clone(),
            config.embedding_dimension,
        ))
    };

    let registry = Arc::new(ToolRegistry::new(http.clone()));
    let _maintenance = spawn_maintenance(registry.clone());

    let resolver: Arc<dyn ToolResolver> = match &config.registry_url {
        Some(url) => {
            info!(registry_url = %url, "resolving tools through remote registry");
            Arc::new(RegistryHttpClient::new(http.clone(), url.clone()))
        }
        None => registry.clone(),
    };

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        bus: bus.clone(),
        llm: llm.clone(),
        resolver,
        http,
    });
    let _workers = spawn_stage_workers(ctx, config.workers_per_stage);
    info!(
        workers_per_stage = config.workers_per_stage,
        "saga stage workers running"
    );

    let _ingestor =
        KbIngestor::new(bus.clone(), llm.clone(), vectors.clone()).spawn();

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        store,
        bus: bus.clone(),
        llm,
        vectors,
        registry,
        api_host: config.api_host.clone(),
        api_port: config.api_port,
    }))));
    lifecycle.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    lifecycle.shutdown().await?;
    bus.shutdown();
    Ok(())
}
