use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ToolDescriptor, ToolHealth, ToolRegistry, HEARTBEAT_INTERVAL};
use crate::core::error::SagaError;

/// Resolves a tool role to a live endpoint. Stage workers depend on this
/// seam; the registry may be in-process or reached over HTTP.
#[async_trait]
pub trait ToolResolver: Send + Sync {
    async fn resolve(&self, role: &str) -> Result<String, SagaError>;
}

#[async_trait]
impl ToolResolver for ToolRegistry {
    async fn resolve(&self, role: &str) -> Result<String, SagaError> {
        ToolRegistry::resolve(self, role)
            .await
            .ok_or_else(|| SagaError::NoLiveTool(role.to_string()))
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    role: &'a str,
    endpoint: &'a str,
    capabilities: &'a [String],
}

/// HTTP client against a remote registry service. Keeps its own round-robin
/// cursor per role so repeated resolutions rotate across replicas.
pub struct RegistryHttpClient {
    http: reqwest::Client,
    base_url: String,
    cursors: Mutex<HashMap<String, usize>>,
}

impl RegistryHttpClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        role: &str,
        endpoint: &str,
        capabilities: &[String],
    ) -> Result<()> {
        self.http
            .post(format!("{}/register", self.base_url))
            .json(&RegisterRequest {
                role,
                endpoint,
                capabilities,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn fetch_servers(&self, role: &str) -> Result<Vec<ToolDescriptor>, SagaError> {
        let res = self
            .http
            .get(format!("{}/servers", self.base_url))
            .query(&[("role", role)])
            .send()
            .await
            .map_err(|e| SagaError::NoLiveTool(format!("{role} (registry unreachable: {e})")))?;
        res.json()
            .await
            .map_err(|e| SagaError::NoLiveTool(format!("{role} (bad registry response: {e})")))
    }
}

#[async_trait]
impl ToolResolver for RegistryHttpClient {
    async fn resolve(&self, role: &str) -> Result<String, SagaError> {
        let mut servers = self.fetch_servers(role).await?;
        servers.retain(|d| d.status == ToolHealth::Healthy);
        if servers.is_empty() {
            return Err(SagaError::NoLiveTool(role.to_string()));
        }
        servers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.endpoint.cmp(&b.endpoint)));

        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(role.to_string()).or_insert(0);
        let picked = servers[*cursor % servers.len()].endpoint.clone();
        *cursor = cursor.wrapping_add(1);
        debug!(role, endpoint = %picked, "resolved tool endpoint");
        Ok(picked)
    }
}

/// Re-register on a 30s tick so the registry keeps seeing this server. Used
/// by tool servers; the returned handle lives as long as the process.
pub fn spawn_heartbeat(
    client: Arc<RegistryHttpClient>,
    role: String,
    endpoint: String,
    capabilities: Vec<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = client.register(&role, &endpoint, &capabilities).await {
                warn!(role = %role, error = %e, "registry heartbeat failed");
            }
        }
    })
}
