use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::stages::{
    extract_sql, format_user_prompt, generate_user_prompt, render_results_table, stage1_catalog,
    truncate_summary, Reflection, RemoteTool, FORMAT_SYSTEM_PROMPT, GENERATE_SYSTEM_PROMPT,
    ROLE_DATABASE,
};
use super::state_store::SagaStore;
use super::{
    now_epoch_ms, SagaPatch, SagaRecord, SagaStatus, StepMetadata, StepRecord, StepStatus,
};
use crate::core::agent::{run_tool_loop, ToolLoopConfig, ToolLoopOutcome};
use crate::core::bus::{
    MessageBus, TOPIC_QUERY_EXECUTED, TOPIC_QUERY_GENERATED, TOPIC_QUERY_INITIATED,
};
use crate::core::error::SagaError;
use crate::core::llm::LlmClient;
use crate::core::registry::client::ToolResolver;
use crate::core::safety::check_statement;
use crate::core::tools::ToolCatalog;

pub const STAGE_TIMEOUT: Duration = Duration::from_secs(180);
pub const REQUEUE_DELAY: Duration = Duration::from_secs(5);

pub const STEP_GENERATE: &str = "generate_query";
pub const STEP_EXECUTE: &str = "execute_query";
pub const STEP_FORMAT: &str = "format_results";

pub const HINT_SELF_CORRECTION: &str = "self_correction";

/// Bus envelope for the query pipeline. Envelopes stay small; the saga
/// record in the store carries the heavy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub saga_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_hint: Option<String>,
}

impl Envelope {
    pub fn new(saga_id: &str, tenant_id: &str) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            tenant_id: tenant_id.to_string(),
            stage_hint: None,
        }
    }

    fn with_hint(mut self, hint: &str) -> Self {
        self.stage_hint = Some(hint.to_string());
        self
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Everything a stage worker needs. Workers hold no per-saga state between
/// messages; the store is the single source of truth.
pub struct WorkerContext {
    pub store: Arc<dyn SagaStore>,
    pub bus: Arc<dyn MessageBus>,
    pub llm: Arc<dyn LlmClient>,
    pub resolver: Arc<dyn ToolResolver>,
    pub http: reqwest::Client,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Generate,
    Execute,
    Format,
}

impl Stage {
    fn topic(self) -> &'static str {
        match self {
            Stage::Generate => TOPIC_QUERY_INITIATED,
            Stage::Execute => TOPIC_QUERY_GENERATED,
            Stage::Format => TOPIC_QUERY_EXECUTED,
        }
    }
}

/// Spawn the per-topic worker pools. Each worker pulls with at-least-once
/// semantics, runs its stage, writes the store, then publishes downstream
/// before acking.
pub fn spawn_stage_workers(
    ctx: Arc<WorkerContext>,
    workers_per_stage: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for stage in [Stage::Generate, Stage::Execute, Stage::Format] {
        for _ in 0..workers_per_stage.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                run_consumer(ctx, stage).await;
            }));
        }
    }
    handles
}

async fn run_consumer(ctx: Arc<WorkerContext>, stage: Stage) {
    let mut consumer = ctx.bus.subscribe(stage.topic()).await;
    while let Some(delivery) = consumer.next().await {
        let Ok(envelope) = serde_json::from_value::<Envelope>(delivery.payload.clone()) else {
            warn!(topic = stage.topic(), "dropping malformed envelope");
            consumer.ack(&delivery).await;
            continue;
        };

        let result = match stage {
            Stage::Generate => handle_generate(&ctx, &envelope).await,
            Stage::Execute => handle_execute(&ctx, &envelope).await,
            Stage::Format => handle_format(&ctx, &envelope).await,
        };

        match result {
            Ok(()) => consumer.ack(&delivery).await,
            Err(e) if e.is_transient() => {
                warn!(
                    saga_id = %envelope.saga_id,
                    error = %e,
                    attempt = delivery.attempt,
                    "stage hit transient failure, requeueing"
                );
                consumer.nack(&delivery, REQUEUE_DELAY).await;
            }
            Err(e) => {
                warn!(saga_id = %envelope.saga_id, error = %e, "stage failed terminally");
                let _ = ctx.store.fail(&envelope.saga_id, &e, None).await;
                consumer.ack(&delivery).await;
            }
        }
    }
}

/// Shared dequeue preamble: drop missing or already-terminal sagas, and
/// terminate sagas whose deadline elapsed while queued.
async fn load_active(
    ctx: &WorkerContext,
    saga_id: &str,
) -> Result<Option<SagaRecord>, SagaError> {
    let Some(saga) = ctx.store.get(saga_id).await? else {
        warn!(saga_id, "saga not found in store, dropping message");
        return Ok(None);
    };
    if saga.status.is_terminal() {
        debug!(saga_id, "saga already terminal, dropping message");
        return Ok(None);
    }
    if saga.deadline_exceeded(now_epoch_ms()) {
        warn!(saga_id, "saga deadline elapsed, terminating");
        ctx.store.fail(saga_id, &SagaError::SagaDeadline, None).await?;
        return Ok(None);
    }
    Ok(Some(saga))
}

fn loop_config(saga: &SagaRecord) -> ToolLoopConfig {
    let remaining = super::SAGA_DEADLINE_MS
        .saturating_sub(now_epoch_ms().saturating_sub(saga.created_at_ms));
    ToolLoopConfig {
        loop_timeout: STAGE_TIMEOUT.min(Duration::from_millis(remaining)),
        ..Default::default()
    }
}

fn stage_step(
    name: &str,
    status: StepStatus,
    started: Instant,
    metadata: StepMetadata,
) -> StepRecord {
    StepRecord {
        step_name: name.to_string(),
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        metadata,
    }
}

fn loop_metadata(prompt: &str, outcome: &ToolLoopOutcome, attempt: u32) -> StepMetadata {
    StepMetadata {
        prompt: Some(prompt.to_string()),
        llm_reasoning: Some(outcome.reasoning.clone()),
        tools_used: outcome.tools_used.clone(),
        usage: Some(outcome.usage),
        attempt: Some(attempt),
        available_tables: available_tables(outcome),
        ..Default::default()
    }
}

/// Tables surfaced by a successful list_tables call, for the step trace.
fn available_tables(outcome: &ToolLoopOutcome) -> Option<Vec<String>> {
    outcome
        .tools_used
        .iter()
        .find(|t| t.tool == "list_tables" && t.status == StepStatus::Success)
        .map(|t| {
            t.response
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .filter(|w| !w.is_empty())
                .map(|w| w.to_string())
                .collect()
        })
}

// ── Stage 1: Discover & Generate ──

async fn handle_generate(ctx: &WorkerContext, envelope: &Envelope) -> Result<(), SagaError> {
    let started = Instant::now();
    let Some(saga) = load_active(ctx, &envelope.saga_id).await? else {
        return Ok(());
    };

    let attempt = saga.correction_attempts();

    // Redelivered after a successful run: just push the pipeline forward.
    if saga.steps_named(STEP_GENERATE) > attempt as usize {
        debug!(saga_id = %envelope.saga_id, "generate already ran for this attempt");
        ctx.bus
            .publish(TOPIC_QUERY_GENERATED, Envelope::new(&saga.saga_id, &saga.tenant_id).payload())
            .await?;
        return Ok(());
    }

    if attempt == 0 {
        ctx.store
            .update(&saga.saga_id, SagaPatch::status(SagaStatus::Generating))
            .await?;
    }

    let reflection = if attempt > 0 {
        Some(Reflection {
            failed_sql: saga.generated_sql.clone().unwrap_or_default(),
            db_error: saga
                .last_step_named(STEP_EXECUTE)
                .and_then(|s| s.metadata.error.clone())
                .unwrap_or_default(),
        })
    } else {
        None
    };

    info!(
        saga_id = %envelope.saga_id,
        tenant_id = %envelope.tenant_id,
        attempt,
        hint = envelope.stage_hint.as_deref().unwrap_or("-"),
        "generating SQL"
    );

    let (catalog, verdict) =
        stage1_catalog(ctx.resolver.clone(), ctx.http.clone(), &saga.tenant_id);
    let prompt = generate_user_prompt(&saga.question, reflection.as_ref());
    let outcome = run_tool_loop(
        ctx.llm.as_ref(),
        GENERATE_SYSTEM_PROMPT,
        &prompt,
        &catalog,
        loop_config(&saga),
    )
    .await;

    // Irrelevant short-circuit: policy refusal, not a pipeline failure. The
    // record still terminates as `error` so pollers see one terminal shape,
    // with is_irrelevant distinguishing it.
    let recorded = verdict.lock().expect("relevance verdict lock").clone();
    if let Some(v) = recorded {
        if !v.is_relevant {
            info!(saga_id = %envelope.saga_id, "question ruled irrelevant");
            let mut metadata = loop_metadata(&prompt, &outcome, attempt);
            metadata.reason = Some(v.reason.clone());
            ctx.store
                .update(
                    &saga.saga_id,
                    SagaPatch {
                        status: Some(SagaStatus::Error),
                        is_irrelevant: Some(true),
                        formatted_response: Some(v.reason.clone()),
                        error_message: Some(SagaError::Irrelevant(v.reason).to_string()),
                        ..Default::default()
                    }
                    .with_step(stage_step(
                        STEP_GENERATE,
                        StepStatus::Success,
                        started,
                        metadata,
                    )),
                )
                .await?;
            return Ok(());
        }
    }

    if let Some(ref failure) = outcome.failure {
        let metadata = loop_metadata(&prompt, &outcome, attempt);
        ctx.store
            .fail(
                &saga.saga_id,
                &failure,
                Some(stage_step(STEP_GENERATE, StepStatus::Error, started, metadata)),
            )
            .await?;
        return Ok(());
    }

    let final_text = outcome.final_text.clone().unwrap_or_default();
    let Some(sql) = extract_sql(&final_text) else {
        let metadata = loop_metadata(&prompt, &outcome, attempt);
        ctx.store
            .fail(
                &saga.saga_id,
                &SagaError::SqlNotProduced,
                Some(stage_step(STEP_GENERATE, StepStatus::Error, started, metadata)),
            )
            .await?;
        return Ok(());
    };

    if let Err(unsafe_err) = check_statement(&sql) {
        warn!(saga_id = %envelope.saga_id, "safety gate rejected generated SQL");
        let mut metadata = loop_metadata(&prompt, &outcome, attempt);
        metadata.sql = Some(sql);
        ctx.store
            .fail(
                &saga.saga_id,
                &unsafe_err,
                Some(stage_step(STEP_GENERATE, StepStatus::Error, started, metadata)),
            )
            .await?;
        return Ok(());
    }

    let mut metadata = loop_metadata(&prompt, &outcome, attempt);
    metadata.sql = Some(sql.clone());
    ctx.store
        .update(
            &saga.saga_id,
            SagaPatch {
                generated_sql: Some(sql),
                ..Default::default()
            }
            .with_step(stage_step(STEP_GENERATE, StepStatus::Success, started, metadata)),
        )
        .await?;

    // Publish before ack; a publish failure leaves the message unacked and
    // the idempotency check above absorbs the redelivery.
    ctx.bus
        .publish(
            TOPIC_QUERY_GENERATED,
            Envelope::new(&saga.saga_id, &saga.tenant_id).payload(),
        )
        .await?;
    Ok(())
}

// ── Stage 2: Execute ──

async fn handle_execute(ctx: &WorkerContext, envelope: &Envelope) -> Result<(), SagaError> {
    let started = Instant::now();
    let Some(saga) = load_active(ctx, &envelope.saga_id).await? else {
        return Ok(());
    };

    let Some(sql) = saga.generated_sql.clone() else {
        ctx.store
            .fail(
                &saga.saga_id,
                &SagaError::ExecutionFailed("no generated SQL on record".to_string()),
                None,
            )
            .await?;
        return Ok(());
    };

    // One execute run per generate run; a redelivery after success only
    // needs to push the pipeline forward.
    if saga.steps_named(STEP_EXECUTE) >= saga.steps_named(STEP_GENERATE) {
        debug!(saga_id = %envelope.saga_id, "execute already ran for this attempt");
        if saga.raw_results.is_some() {
            ctx.bus
                .publish(
                    TOPIC_QUERY_EXECUTED,
                    Envelope::new(&saga.saga_id, &saga.tenant_id).payload(),
                )
                .await?;
        } else if saga.retry_budget < super::SELF_CORRECTION_BUDGET {
            // Last run failed and its re-entry publish may have been lost
            // with the ack; stage 1's own idempotency absorbs duplicates.
            ctx.bus
                .publish(
                    TOPIC_QUERY_INITIATED,
                    Envelope::new(&saga.saga_id, &saga.tenant_id)
                        .with_hint(HINT_SELF_CORRECTION)
                        .payload(),
                )
                .await?;
        }
        return Ok(());
    }

    ctx.store
        .update(&saga.saga_id, SagaPatch::status(SagaStatus::Executing))
        .await?;

    info!(saga_id = %envelope.saga_id, "executing SQL");
    let tool = RemoteTool::new(
        ctx.resolver.clone(),
        ctx.http.clone(),
        ROLE_DATABASE,
        "execute_sql",
        &saga.tenant_id,
    );

    let content = match tool.invoke(serde_json::json!({ "sql": sql })).await {
        Ok(content) => content,
        Err(SagaError::NoLiveTool(role)) => {
            // Infrastructure outage, not a bad query: requeue and let the
            // registry recover.
            return Err(SagaError::NoLiveTool(role));
        }
        Err(SagaError::ExecutionFailed(db_error)) => {
            return self_correct_or_fail(ctx, &saga, &sql, db_error, started).await;
        }
        Err(other) => {
            return self_correct_or_fail(ctx, &saga, &sql, other.to_string(), started).await;
        }
    };

    let (table, result_lines) = render_results_table(&content);
    let metadata = StepMetadata {
        sql: Some(sql),
        result_lines: Some(result_lines),
        attempt: Some(saga.correction_attempts()),
        ..Default::default()
    };
    ctx.store
        .update(
            &saga.saga_id,
            SagaPatch {
                raw_results: Some(table),
                ..Default::default()
            }
            .with_step(stage_step(STEP_EXECUTE, StepStatus::Success, started, metadata)),
        )
        .await?;

    ctx.bus
        .publish(
            TOPIC_QUERY_EXECUTED,
            Envelope::new(&saga.saga_id, &saga.tenant_id).payload(),
        )
        .await?;
    Ok(())
}

/// Execution failed: burn one unit of retry budget and route back to stage 1
/// with the failure attached, or terminate once the budget is spent.
async fn self_correct_or_fail(
    ctx: &WorkerContext,
    saga: &SagaRecord,
    sql: &str,
    db_error: String,
    started: Instant,
) -> Result<(), SagaError> {
    let step = stage_step(
        STEP_EXECUTE,
        StepStatus::Error,
        started,
        StepMetadata {
            sql: Some(sql.to_string()),
            error: Some(db_error.clone()),
            attempt: Some(saga.correction_attempts()),
            ..Default::default()
        },
    );

    if saga.retry_budget > 0 {
        info!(
            saga_id = %saga.saga_id,
            retry_budget = saga.retry_budget,
            "execution failed, re-entering generation for self-correction"
        );
        ctx.store
            .update(
                &saga.saga_id,
                SagaPatch {
                    retry_budget: Some(saga.retry_budget - 1),
                    ..Default::default()
                }
                .with_step(step),
            )
            .await?;
        ctx.bus
            .publish(
                TOPIC_QUERY_INITIATED,
                Envelope::new(&saga.saga_id, &saga.tenant_id)
                    .with_hint(HINT_SELF_CORRECTION)
                    .payload(),
            )
            .await?;
        return Ok(());
    }

    warn!(saga_id = %saga.saga_id, "execution failed with no retry budget left");
    ctx.store
        .fail(&saga.saga_id, &SagaError::ExecutionFailed(db_error), Some(step))
        .await?;
    Ok(())
}

// ── Stage 3: Format ──

async fn handle_format(ctx: &WorkerContext, envelope: &Envelope) -> Result<(), SagaError> {
    let started = Instant::now();
    let Some(saga) = load_active(ctx, &envelope.saga_id).await? else {
        return Ok(());
    };

    ctx.store
        .update(&saga.saga_id, SagaPatch::status(SagaStatus::Formatting))
        .await?;

    let prompt = format_user_prompt(
        &saga.question,
        saga.generated_sql.as_deref().unwrap_or_default(),
        saga.raw_results.as_deref().unwrap_or_default(),
    );

    info!(saga_id = %envelope.saga_id, "formatting results");
    // No tools: the loop degenerates to a single constrained generation.
    let outcome = run_tool_loop(
        ctx.llm.as_ref(),
        FORMAT_SYSTEM_PROMPT,
        &prompt,
        &ToolCatalog::new(),
        loop_config(&saga),
    )
    .await;

    if let Some(ref failure) = outcome.failure {
        let metadata = loop_metadata(&prompt, &outcome, 0);
        ctx.store
            .fail(
                &saga.saga_id,
                &failure,
                Some(stage_step(STEP_FORMAT, StepStatus::Error, started, metadata)),
            )
            .await?;
        return Ok(());
    }

    let summary = truncate_summary(outcome.final_text.as_deref().unwrap_or_default());
    let metadata = loop_metadata(&prompt, &outcome, 0);
    ctx.store
        .complete(
            &saga.saga_id,
            summary,
            Some(stage_step(STEP_FORMAT, StepStatus::Success, started, metadata)),
        )
        .await?;
    info!(saga_id = %envelope.saga_id, "saga completed");
    Ok(())
}
