use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, Mutex};

use crate::core::error::SagaError;
use crate::core::mcp::McpHttpClient;
use crate::core::registry::client::ToolResolver;
use crate::core::tools::{object_schema, ToolCatalog, ToolHandler, ToolSpec};

pub const ROLE_DATABASE: &str = "database";
pub const ROLE_KNOWLEDGE_BASE: &str = "knowledge-base";
pub const MAX_RESULT_ROWS: usize = 50;
pub const MAX_SUMMARY_CHARS: usize = 2000;
pub const TRUNCATION_MARKER: &str = "*...truncated...*";

// ── Stage prompts ──

pub const GENERATE_SYSTEM_PROMPT: &str = "\
You are a senior SQL analyst answering questions about one tenant's database.

RULES:
1. If the question cannot be answered from this tenant's data (it is off-topic, \
or about the world rather than the database), call check_relevance with \
is_relevant=false and a short reason, then stop.
2. Otherwise, discover the schema first: call list_tables, then describe_table \
for every table you intend to reference.
3. Consult search_knowledge_base for business definitions (revenue, churn, ...) \
before assuming a formula.
4. Finish with exactly one read-only SQL statement in a fenced block:

```sql
SELECT ...
```

Never produce INSERT, UPDATE, DELETE, or DDL. Do not invent tables or columns.";

pub const FORMAT_SYSTEM_PROMPT: &str = "\
You are a data analyst writing an executive summary of query results. Answer \
the original question directly, highlight the key figures, and stay under \
2000 characters. No technical jargon, no SQL.";

/// Context for a stage-1 re-entry after an execution failure.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub failed_sql: String,
    pub db_error: String,
}

pub fn generate_user_prompt(question: &str, reflection: Option<&Reflection>) -> String {
    match reflection {
        None => format!("Question: {question}"),
        Some(r) => format!(
            "Question: {question}\n\n\
             Your previous attempt failed. The SQL\n\n```sql\n{}\n```\n\n\
             was rejected by the database with:\n\n{}\n\n\
             Re-check the schema with describe_table and produce a corrected query.",
            r.failed_sql, r.db_error
        ),
    }
}

pub fn format_user_prompt(question: &str, sql: &str, raw_results: &str) -> String {
    format!(
        "Original question: {question}\n\nSQL executed:\n{sql}\n\nResults:\n{raw_results}"
    )
}

// ── SQL extraction & result rendering ──

/// Pull the single fenced SQL statement out of the model's final text.
pub fn extract_sql(text: &str) -> Option<String> {
    let fence = Regex::new(r"(?s)```(?:sql)?\s*\n?(.*?)```").ok()?;
    let captured = fence.captures(text)?.get(1)?.as_str().trim();
    let sql = captured.trim_end_matches(';').trim();
    if sql.is_empty() {
        return None;
    }
    Some(sql.to_string())
}

#[derive(Deserialize)]
struct ExecuteResult {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render an execute_sql payload as a markdown table capped at 50 rows.
/// Content that is not the structured row format passes through untouched.
pub fn render_results_table(content: &str) -> (String, usize) {
    let Ok(result) = serde_json::from_str::<ExecuteResult>(content) else {
        return (content.to_string(), content.lines().count());
    };

    let mut out = String::new();
    out.push_str(&format!("| {} |\n", result.columns.join(" | ")));
    out.push_str(&format!(
        "|{}\n",
        " --- |".repeat(result.columns.len().max(1))
    ));

    let total = result.rows.len();
    for row in result.rows.iter().take(MAX_RESULT_ROWS) {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    if total > MAX_RESULT_ROWS {
        out.push_str(TRUNCATION_MARKER);
        out.push('\n');
    }
    (out, total)
}

/// Clamp the formatted summary to the executive-summary budget.
pub fn truncate_summary(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(MAX_SUMMARY_CHARS - 1).collect();
    clipped.push('…');
    clipped
}

// ── Stage-1 tool handlers ──

/// Dispatches one named tool on a replicated tool server, resolving a live
/// endpoint through the registry on every call. The tenant id is injected
/// into every argument object so remote tools stay tenant-scoped.
pub struct RemoteTool {
    resolver: Arc<dyn ToolResolver>,
    http: reqwest::Client,
    role: &'static str,
    tool: &'static str,
    tenant_id: String,
}

impl RemoteTool {
    pub fn new(
        resolver: Arc<dyn ToolResolver>,
        http: reqwest::Client,
        role: &'static str,
        tool: &'static str,
        tenant_id: &str,
    ) -> Self {
        Self {
            resolver,
            http,
            role,
            tool,
            tenant_id: tenant_id.to_string(),
        }
    }

    pub async fn invoke(&self, args: serde_json::Value) -> Result<String, SagaError> {
        let mut args = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(SagaError::ExecutionFailed(format!(
                    "tool arguments must be an object, got {other}"
                )))
            }
        };
        args.insert(
            "tenant_id".to_string(),
            serde_json::Value::String(self.tenant_id.clone()),
        );

        let endpoint = self.resolver.resolve(self.role).await?;
        let client = McpHttpClient::new(self.http.clone(), endpoint);
        let result = client
            .call_tool(self.tool, &serde_json::Value::Object(args))
            .await
            .map_err(|e| SagaError::ExecutionFailed(e.to_string()))?;
        if result.is_error {
            return Err(SagaError::ExecutionFailed(result.content));
        }
        Ok(result.content)
    }
}

#[async_trait]
impl ToolHandler for RemoteTool {
    async fn call(&self, args: serde_json::Value) -> Result<String> {
        // Inside the loop a resolution failure is feedback to the model,
        // not a worker crash; stage 2 calls invoke() directly and keeps the
        // typed error.
        self.invoke(args).await.map_err(|e| anyhow!(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RelevanceVerdict {
    pub is_relevant: bool,
    pub reason: String,
}

/// In-process tool: the model calls it to mark a question as out of scope.
/// The worker inspects the shared slot after the loop finishes.
pub struct CheckRelevanceTool {
    verdict: Arc<Mutex<Option<RelevanceVerdict>>>,
}

impl CheckRelevanceTool {
    pub fn new() -> (Self, Arc<Mutex<Option<RelevanceVerdict>>>) {
        let verdict = Arc::new(Mutex::new(None));
        (
            Self {
                verdict: verdict.clone(),
            },
            verdict,
        )
    }
}

#[async_trait]
impl ToolHandler for CheckRelevanceTool {
    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let is_relevant = args
            .get("is_relevant")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        *self.verdict.lock().expect("relevance verdict lock") = Some(RelevanceVerdict {
            is_relevant,
            reason,
        });
        Ok("Relevance decision recorded.".to_string())
    }
}

/// The discover-and-generate tool set, plus the slot the relevance verdict
/// lands in.
pub fn stage1_catalog(
    resolver: Arc<dyn ToolResolver>,
    http: reqwest::Client,
    tenant_id: &str,
) -> (ToolCatalog, Arc<Mutex<Option<RelevanceVerdict>>>) {
    let mut catalog = ToolCatalog::new();

    catalog.register(ToolSpec::new(
        "search_knowledge_base",
        "Search the tenant's business knowledge base for definitions and context.",
        object_schema(&[("query", "string", "What to look up")]),
        Arc::new(RemoteTool::new(
            resolver.clone(),
            http.clone(),
            ROLE_KNOWLEDGE_BASE,
            "search_knowledge_base",
            tenant_id,
        )),
    ));
    catalog.register(ToolSpec::new(
        "list_tables",
        "List the tables available in the tenant's database.",
        object_schema(&[]),
        Arc::new(RemoteTool::new(
            resolver.clone(),
            http.clone(),
            ROLE_DATABASE,
            "list_tables",
            tenant_id,
        )),
    ));
    catalog.register(ToolSpec::new(
        "describe_table",
        "Describe a table's columns and types.",
        object_schema(&[("name", "string", "Table name")]),
        Arc::new(RemoteTool::new(
            resolver,
            http,
            ROLE_DATABASE,
            "describe_table",
            tenant_id,
        )),
    ));

    let (relevance, verdict) = CheckRelevanceTool::new();
    catalog.register(ToolSpec::new(
        "check_relevance",
        "Declare whether the question can be answered from this tenant's data.",
        object_schema(&[
            ("reason", "string", "Why the question is in or out of scope"),
            ("is_relevant", "boolean", "false when out of scope"),
        ]),
        Arc::new(relevance),
    ));

    (catalog, verdict)
}
