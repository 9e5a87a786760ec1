mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::bus::MessageBus;
use crate::core::kb::vector::VectorStore;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::llm::LlmClient;
use crate::core::registry::ToolRegistry;
use crate::core::saga::state_store::SagaStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<dyn SagaStore>,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) vectors: Arc<dyn VectorStore>,
    pub(crate) registry: Arc<ToolRegistry>,
}

pub struct ApiServerConfig {
    pub store: Arc<dyn SagaStore>,
    pub bus: Arc<dyn MessageBus>,
    pub llm: Arc<dyn LlmClient>,
    pub vectors: Arc<dyn VectorStore>,
    pub registry: Arc<ToolRegistry>,
    pub api_host: String,
    pub api_port: u16,
}

pub struct ApiServer {
    config: ApiServerConfig,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = AppState {
            store: self.config.store.clone(),
            bus: self.config.bus.clone(),
            llm: self.config.llm.clone(),
            vectors: self.config.vectors.clone(),
            registry: self.config.registry.clone(),
        };
        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("API server running at http://{addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!("API server crashed: {}", e);
                    }
                }
                Err(e) => tracing::error!("API server failed to bind {addr}: {}", e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        Ok(())
    }
}
