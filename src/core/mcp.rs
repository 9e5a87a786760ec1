use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const TOOL_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpToolResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Serialize)]
struct CallToolRequest<'a> {
    name: &'a str,
    arguments: &'a Value,
}

#[derive(Deserialize)]
struct ListToolsResponse {
    tools: Vec<McpTool>,
}

/// Client for one tool server endpoint. Tool servers expose a uniform JSON
/// protocol: `list_tools` for discovery and `call_tool(name, args)` for
/// invocation; failures are in-band via `is_error`.
pub struct McpHttpClient {
    client: reqwest::Client,
    endpoint: String,
}

impl McpHttpClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let res = self
            .client
            .get(format!("{}/list_tools", self.endpoint))
            .timeout(TOOL_HTTP_TIMEOUT)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("tool server error ({})", res.status()));
        }
        let parsed: ListToolsResponse = res.json().await?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<McpToolResult> {
        debug!(endpoint = %self.endpoint, tool = name, "calling remote tool");
        let res = self
            .client
            .post(format!("{}/call_tool", self.endpoint))
            .timeout(TOOL_HTTP_TIMEOUT)
            .json(&CallToolRequest { name, arguments })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "tool server error ({}): {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }
        Ok(res.json().await?)
    }
}
