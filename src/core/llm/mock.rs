use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use super::{ChatMessage, LlmClient, LlmOutput, TokenUsage, ToolCall, ToolDefinition};

/// Deterministic stand-in for the vendor LLM, selected by `MOCK_LLM`.
///
/// In its default mode it drives the stage-1 tool loop through real tool
/// calls (list_tables, describe_table, search_knowledge_base) before emitting
/// SQL, so integration tests exercise the registry and loop wiring instead of
/// short-circuiting to canned text. Tests can also script exact outputs.
pub struct MockLlmClient {
    script: Mutex<VecDeque<LlmOutput>>,
    repeat: Option<LlmOutput>,
    dimension: usize,
}

impl MockLlmClient {
    pub fn deterministic() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            dimension: 768,
        }
    }

    /// Pop the given outputs in order; panics in tests if exhausted.
    pub fn scripted(outputs: Vec<LlmOutput>) -> Self {
        Self {
            script: Mutex::new(outputs.into()),
            repeat: None,
            dimension: 768,
        }
    }

    /// Return the same output on every call (iteration-budget tests).
    pub fn repeating(output: LlmOutput) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(output),
            dimension: 768,
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    fn mock_usage() -> TokenUsage {
        TokenUsage {
            prompt_tokens: 10,
            response_tokens: 5,
            total_tokens: 15,
        }
    }

    fn call(name: &str, arguments: serde_json::Value, seq: usize) -> LlmOutput {
        LlmOutput {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("mock_call_{seq}"),
                name: name.to_string(),
                arguments,
            }],
            usage: Some(Self::mock_usage()),
        }
    }

    fn text(content: String) -> LlmOutput {
        LlmOutput {
            text: content,
            tool_calls: Vec::new(),
            usage: Some(Self::mock_usage()),
        }
    }

    /// Stage-1 behavior: refuse weather-style questions, otherwise walk the
    /// discovery tools once each and finish with a fenced SELECT.
    fn generate_stage(messages: &[ChatMessage], tools: &[ToolDefinition]) -> LlmOutput {
        let question = messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let has_relevance_tool = tools.iter().any(|t| t.name == "check_relevance");
        if tools.is_empty() || !has_relevance_tool {
            // Formatting / synthesis stage: plain text, no tools.
            return Self::text(format!(
                "Summary: based on the executed query, here is what the data shows. {}",
                question.lines().next().unwrap_or_default()
            ));
        }

        let relevance_recorded = messages
            .iter()
            .any(|m| m.role == "tool" && m.content.contains("Relevance decision recorded"));
        if relevance_recorded {
            return Self::text("The question is out of scope for this database.".to_string());
        }

        if question.to_lowercase().contains("weather") {
            return Self::call(
                "check_relevance",
                serde_json::json!({
                    "is_relevant": false,
                    "reason": "The question is not about your database."
                }),
                0,
            );
        }

        let tool_turns = messages.iter().filter(|m| m.role == "tool").count();
        match tool_turns {
            0 => Self::call("list_tables", serde_json::json!({}), 1),
            1 => {
                // Use the first table the previous tool call surfaced.
                let table = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "tool")
                    .and_then(|m| first_identifier(&m.content))
                    .unwrap_or_else(|| "orders".to_string());
                Self::call("describe_table", serde_json::json!({ "name": table }), 2)
            }
            2 => Self::call(
                "search_knowledge_base",
                serde_json::json!({ "query": question }),
                3,
            ),
            _ => {
                let reflected = messages
                    .iter()
                    .any(|m| m.content.contains("previous attempt failed"));
                let sql = if reflected {
                    "SELECT user_id, COUNT(*) AS orders FROM orders GROUP BY user_id ORDER BY orders DESC LIMIT 5"
                } else {
                    "SELECT customer, SUM(quantity * price) AS total FROM orders GROUP BY customer ORDER BY total DESC LIMIT 5"
                };
                Self::text(format!(
                    "The discovered schema covers the question.\n\n```sql\n{sql}\n```\n"
                ))
            }
        }
    }
}

/// First bare SQL-ish identifier in a tool response, used to pick a table.
fn first_identifier(text: &str) -> Option<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|w| !w.is_empty() && w.chars().next().is_some_and(|c| c.is_ascii_alphabetic()))
        .map(|w| w.to_string())
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmOutput> {
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return Ok(scripted);
        }
        if let Some(repeat) = &self.repeat {
            return Ok(repeat.clone());
        }
        Ok(Self::generate_stage(messages, tools))
    }

    /// Bag-of-words hashing: texts sharing vocabulary land near each other,
    /// which is enough to drive the chunker's topic-shift behavior.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dimension];
                for word in text
                    .split(|c: char| !c.is_ascii_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let mut hash: u64 = 0xcbf29ce484222325;
                    for b in word.to_ascii_lowercase().bytes() {
                        hash ^= b as u64;
                        hash = hash.wrapping_mul(0x100000001b3);
                    }
                    v[(hash % self.dimension as u64) as usize] += 1.0;
                }
                v
            })
            .collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }
}
