pub mod stages;
pub mod state_store;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::llm::TokenUsage;

/// Saga status. Transitions are monotonic along pending → generating →
/// executing → formatting → completed, except any stage may short-circuit to
/// `error` or straight to `completed`. Terminal records are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Generating,
    Executing,
    Formatting,
    Completed,
    Error,
}

impl SagaStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            SagaStatus::Pending => 0,
            SagaStatus::Generating => 1,
            SagaStatus::Executing => 2,
            SagaStatus::Formatting => 3,
            SagaStatus::Completed => 4,
            SagaStatus::Error => 4,
        }
    }

    pub fn can_transition(self, to: SagaStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == to {
            return true;
        }
        if to == SagaStatus::Error || to == SagaStatus::Completed {
            return true;
        }
        to.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Generating => "generating",
            SagaStatus::Executing => "executing",
            SagaStatus::Formatting => "formatting",
            SagaStatus::Completed => "completed",
            SagaStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Success,
    Error,
    Failed,
}

/// One dispatched tool invocation inside a step, in iteration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: serde_json::Value,
    pub response: String,
    pub duration_ms: u64,
    pub status: StepStatus,
}

/// Stage-specific step metadata. Fields are optional so each stage only
/// writes what it produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_tables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Which run of this step this is (0 for the first, 1 after one
    /// self-correction re-entry). Used for idempotent redelivery handling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: StepMetadata,
}

pub const SELF_CORRECTION_BUDGET: u32 = 1;
pub const SAGA_TTL_SECS: u64 = 3600;
pub const SAGA_DEADLINE_MS: u64 = 5 * 60 * 1000;

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The externally-owned state of one natural-language query. Heavy state
/// lives here; bus envelopes only carry the saga id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: String,
    pub tenant_id: String,
    pub question: String,
    pub status: SagaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_results: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_response: Option<String>,
    #[serde(default)]
    pub is_irrelevant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub call_stack: Vec<StepRecord>,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Remaining stage-1 re-entries after an execution failure.
    pub retry_budget: u32,
    pub created_at_ms: u64,
}

impl SagaRecord {
    pub fn new(saga_id: String, tenant_id: String, question: String) -> Self {
        Self {
            saga_id,
            tenant_id,
            question,
            status: SagaStatus::Pending,
            generated_sql: None,
            raw_results: None,
            formatted_response: None,
            is_irrelevant: false,
            error_message: None,
            call_stack: Vec::new(),
            total_duration_ms: 0,
            total_tokens: 0,
            retry_budget: SELF_CORRECTION_BUDGET,
            created_at_ms: now_epoch_ms(),
        }
    }

    pub fn deadline_exceeded(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > SAGA_DEADLINE_MS
    }

    /// Self-correction re-entries consumed so far.
    pub fn correction_attempts(&self) -> u32 {
        SELF_CORRECTION_BUDGET - self.retry_budget
    }

    pub fn steps_named(&self, name: &str) -> usize {
        self.call_stack.iter().filter(|s| s.step_name == name).count()
    }

    pub fn last_step_named(&self, name: &str) -> Option<&StepRecord> {
        self.call_stack.iter().rev().find(|s| s.step_name == name)
    }

    fn recompute_rollups(&mut self) {
        self.total_duration_ms = self.call_stack.iter().map(|s| s.duration_ms).sum();
        self.total_tokens = self
            .call_stack
            .iter()
            .filter_map(|s| s.metadata.usage.as_ref())
            .map(|u| u.total_tokens)
            .sum();
    }

    /// Apply a partial update. Fields the patch does not set are untouched;
    /// the call stack only ever grows; terminal records reject every change.
    pub fn apply(&mut self, patch: SagaPatch) -> Result<(), PatchRejected> {
        if self.status.is_terminal() {
            return Err(PatchRejected::Terminal);
        }
        if let Some(status) = patch.status {
            if !self.status.can_transition(status) {
                return Err(PatchRejected::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            self.status = status;
        }
        if let Some(sql) = patch.generated_sql {
            self.generated_sql = Some(sql);
        }
        if let Some(raw) = patch.raw_results {
            self.raw_results = Some(raw);
        }
        if let Some(formatted) = patch.formatted_response {
            self.formatted_response = Some(formatted);
        }
        if let Some(flag) = patch.is_irrelevant {
            self.is_irrelevant = flag;
        }
        if let Some(msg) = patch.error_message {
            self.error_message = Some(msg);
        }
        if let Some(budget) = patch.retry_budget {
            self.retry_budget = budget;
        }
        self.call_stack.extend(patch.append_steps);
        self.recompute_rollups();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchRejected {
    #[error("saga is terminal")]
    Terminal,
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },
}

/// Partial update to a saga record. `append_steps` is the only way the call
/// stack changes.
#[derive(Debug, Clone, Default)]
pub struct SagaPatch {
    pub status: Option<SagaStatus>,
    pub generated_sql: Option<String>,
    pub raw_results: Option<String>,
    pub formatted_response: Option<String>,
    pub is_irrelevant: Option<bool>,
    pub error_message: Option<String>,
    pub retry_budget: Option<u32>,
    pub append_steps: Vec<StepRecord>,
}

impl SagaPatch {
    pub fn status(status: SagaStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: StepRecord) -> Self {
        self.append_steps.push(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SagaRecord {
        SagaRecord::new("s1".into(), "acme".into(), "top customers?".into())
    }

    fn step(name: &str, status: StepStatus) -> StepRecord {
        StepRecord {
            step_name: name.to_string(),
            status,
            duration_ms: 10,
            metadata: StepMetadata::default(),
        }
    }

    #[test]
    fn status_progression_is_monotonic() {
        assert!(SagaStatus::Pending.can_transition(SagaStatus::Generating));
        assert!(SagaStatus::Generating.can_transition(SagaStatus::Executing));
        assert!(SagaStatus::Executing.can_transition(SagaStatus::Formatting));
        assert!(SagaStatus::Formatting.can_transition(SagaStatus::Completed));
        assert!(!SagaStatus::Executing.can_transition(SagaStatus::Generating));
        assert!(!SagaStatus::Formatting.can_transition(SagaStatus::Pending));
    }

    #[test]
    fn any_stage_may_short_circuit() {
        assert!(SagaStatus::Pending.can_transition(SagaStatus::Error));
        assert!(SagaStatus::Generating.can_transition(SagaStatus::Completed));
        assert!(SagaStatus::Executing.can_transition(SagaStatus::Error));
    }

    #[test]
    fn terminal_states_are_frozen() {
        assert!(!SagaStatus::Completed.can_transition(SagaStatus::Error));
        assert!(!SagaStatus::Error.can_transition(SagaStatus::Completed));

        let mut saga = record();
        saga.status = SagaStatus::Error;
        let rejected = saga.apply(SagaPatch::status(SagaStatus::Generating));
        assert_eq!(rejected, Err(PatchRejected::Terminal));
    }

    #[test]
    fn patch_does_not_clobber_unset_fields() {
        let mut saga = record();
        saga.apply(SagaPatch {
            generated_sql: Some("SELECT 1".into()),
            ..Default::default()
        })
        .unwrap();
        saga.apply(SagaPatch {
            raw_results: Some("| a |".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(saga.generated_sql.as_deref(), Some("SELECT 1"));
        assert_eq!(saga.raw_results.as_deref(), Some("| a |"));
    }

    #[test]
    fn call_stack_is_append_only_and_rolls_up() {
        let mut saga = record();
        let mut first = step("generate_query", StepStatus::Success);
        first.metadata.usage = Some(TokenUsage {
            prompt_tokens: 100,
            response_tokens: 20,
            total_tokens: 120,
        });
        saga.apply(SagaPatch::default().with_step(first)).unwrap();
        saga.apply(SagaPatch::default().with_step(step("execute_query", StepStatus::Success)))
            .unwrap();

        assert_eq!(saga.call_stack.len(), 2);
        assert_eq!(saga.total_duration_ms, 20);
        assert_eq!(saga.total_tokens, 120);
    }

    #[test]
    fn deadline_check_uses_creation_time() {
        let saga = record();
        assert!(!saga.deadline_exceeded(saga.created_at_ms + 1000));
        assert!(saga.deadline_exceeded(saga.created_at_ms + SAGA_DEADLINE_MS + 1));
    }
}
