pub mod client;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_AFTER_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolHealth {
    Healthy,
    Unhealthy,
    Error,
}

/// One registered tool server, keyed by (role, endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub role: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Epoch seconds of the last registration or heartbeat.
    pub last_seen: u64,
    pub status: ToolHealth,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<(String, String), ToolDescriptor>,
    cursors: HashMap<String, usize>,
}

/// Registry of live tool servers. Tool servers register on startup and
/// heartbeat every 30s; a background maintenance tick probes health and
/// sweeps entries not seen for an hour.
pub struct ToolRegistry {
    state: Mutex<RegistryState>,
    http: reqwest::Client,
}

impl ToolRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            http,
        }
    }

    pub async fn register(&self, role: &str, endpoint: &str, capabilities: Vec<String>) {
        let mut state = self.state.lock().await;
        let key = (role.to_string(), endpoint.to_string());
        let fresh = !state.entries.contains_key(&key);
        state.entries.insert(
            key,
            ToolDescriptor {
                role: role.to_string(),
                endpoint: endpoint.to_string(),
                capabilities,
                last_seen: now_epoch_secs(),
                status: ToolHealth::Healthy,
                consecutive_failures: 0,
            },
        );
        if fresh {
            info!(role, endpoint, "registered tool server");
        }
    }

    pub async fn servers(&self, role: Option<&str>) -> Vec<ToolDescriptor> {
        let state = self.state.lock().await;
        let mut list: Vec<ToolDescriptor> = state
            .entries
            .values()
            .filter(|d| role.map_or(true, |r| d.role == r))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.endpoint.cmp(&b.endpoint)));
        list
    }

    /// Round-robin across the role's healthy endpoints, most recently seen
    /// first within a rotation.
    pub async fn resolve(&self, role: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let mut healthy: Vec<&ToolDescriptor> = state
            .entries
            .values()
            .filter(|d| d.role == role && d.status == ToolHealth::Healthy)
            .collect();
        if healthy.is_empty() {
            return None;
        }
        healthy.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.endpoint.cmp(&b.endpoint)));
        let endpoints: Vec<String> = healthy.iter().map(|d| d.endpoint.clone()).collect();

        let cursor = state.cursors.entry(role.to_string()).or_insert(0);
        let picked = endpoints[*cursor % endpoints.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(picked)
    }

    /// Drop entries whose last heartbeat is older than an hour.
    pub async fn sweep_stale(&self) {
        let cutoff = now_epoch_secs().saturating_sub(STALE_AFTER_SECS);
        let mut state = self.state.lock().await;
        state.entries.retain(|_, d| {
            if d.last_seen < cutoff {
                warn!(role = %d.role, endpoint = %d.endpoint, "sweeping stale tool server");
                false
            } else {
                true
            }
        });
    }

    /// Probe every entry's health endpoint. One failure marks it unhealthy;
    /// a second consecutive failure marks it errored. A success resets it.
    pub async fn probe_all(&self) {
        let targets: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .entries
                .values()
                .map(|d| (d.role.clone(), d.endpoint.clone()))
                .collect()
        };

        for (role, endpoint) in targets {
            let ok = self.probe(&endpoint).await;
            let mut state = self.state.lock().await;
            if let Some(entry) = state.entries.get_mut(&(role.clone(), endpoint.clone())) {
                if ok {
                    entry.status = ToolHealth::Healthy;
                    entry.consecutive_failures = 0;
                } else {
                    entry.consecutive_failures += 1;
                    entry.status = if entry.consecutive_failures >= 2 {
                        ToolHealth::Error
                    } else {
                        ToolHealth::Unhealthy
                    };
                    warn!(
                        role,
                        endpoint,
                        failures = entry.consecutive_failures,
                        "tool server probe failed"
                    );
                }
            }
        }
    }

    async fn probe(&self, endpoint: &str) -> bool {
        self.http
            .get(format!("{}/health", endpoint.trim_end_matches('/')))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    #[cfg(test)]
    async fn set_status(&self, role: &str, endpoint: &str, status: ToolHealth) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&(role.to_string(), endpoint.to_string())) {
            entry.status = status;
        }
    }

    #[cfg(test)]
    async fn set_last_seen(&self, role: &str, endpoint: &str, last_seen: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&(role.to_string(), endpoint.to_string())) {
            entry.last_seen = last_seen;
        }
    }
}

/// Background probe + sweep loop for an in-process registry.
pub fn spawn_maintenance(registry: Arc<ToolRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            registry.probe_all().await;
            registry.sweep_stale().await;
        }
    })
}
