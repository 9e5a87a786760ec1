use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::error::SagaError;
use crate::core::llm::{ChatMessage, LlmClient, TokenUsage};
use crate::core::saga::{StepStatus, ToolCallRecord};
use crate::core::tools::{validate_args, ToolCatalog};

pub const DEFAULT_MAX_ITERATIONS: usize = 8;
pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy)]
pub struct ToolLoopConfig {
    pub max_iterations: usize,
    pub loop_timeout: Duration,
    pub tool_call_timeout: Duration,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            loop_timeout: DEFAULT_LOOP_TIMEOUT,
            tool_call_timeout: TOOL_CALL_TIMEOUT,
        }
    }
}

/// Result of one loop invocation. Exactly one of `final_text` / `failure` is
/// set; the trace fields are populated either way so a failing saga still
/// carries its partial call stack.
#[derive(Debug, Default)]
pub struct ToolLoopOutcome {
    pub final_text: Option<String>,
    pub failure: Option<SagaError>,
    pub tools_used: Vec<ToolCallRecord>,
    pub usage: TokenUsage,
    pub iterations: usize,
    /// Last assistant text seen before the loop ended.
    pub reasoning: String,
}

/// Drive a bounded chat-with-tools iteration: call the model, dispatch any
/// requested tool calls one at a time, feed results back, and repeat until
/// the model answers in plain text or a bound trips.
///
/// A single failing tool never aborts the loop; the error goes back to the
/// model as a tool message so it can self-correct. The same path handles
/// hallucinated tool names and malformed arguments.
pub async fn run_tool_loop(
    llm: &dyn LlmClient,
    system_prompt: &str,
    user_message: &str,
    catalog: &ToolCatalog,
    config: ToolLoopConfig,
) -> ToolLoopOutcome {
    let started = Instant::now();
    let definitions = catalog.definitions();
    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_message),
    ];
    let mut outcome = ToolLoopOutcome::default();

    for iteration in 1..=config.max_iterations {
        if started.elapsed() >= config.loop_timeout {
            warn!(iteration, "tool loop exceeded its wall-clock budget");
            outcome.failure = Some(SagaError::LoopTimeout);
            return outcome;
        }
        outcome.iterations = iteration;

        let generated =
            match tokio::time::timeout(LLM_CALL_TIMEOUT, llm.generate(&messages, &definitions))
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    outcome.failure = Some(SagaError::Llm(e.to_string()));
                    return outcome;
                }
                Err(_) => {
                    outcome.failure = Some(SagaError::Llm("model call timed out".to_string()));
                    return outcome;
                }
            };

        if let Some(usage) = generated.usage {
            outcome.usage.accumulate(usage);
        }
        if !generated.text.trim().is_empty() {
            outcome.reasoning = generated.text.trim().to_string();
        }

        if generated.tool_calls.is_empty() {
            info!(iteration, "tool loop finished with a text answer");
            outcome.final_text = Some(generated.text);
            return outcome;
        }

        messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: generated.text,
            tool_calls: generated.tool_calls.clone(),
            tool_call_id: None,
        });

        // One call at a time: the transcript stays a total order.
        for call in generated.tool_calls {
            let call_started = Instant::now();
            let (response, status) = dispatch(catalog, &call.name, &call.arguments, config).await;
            let duration_ms = call_started.elapsed().as_millis() as u64;

            info!(
                tool = %call.name,
                status = ?status,
                duration_ms,
                "tool call dispatched"
            );

            outcome.tools_used.push(ToolCallRecord {
                tool: call.name.clone(),
                args: call.arguments.clone(),
                response: response.clone(),
                duration_ms,
                status,
            });
            messages.push(ChatMessage::tool_response(call.id, response));
        }
    }

    warn!(
        max_iterations = config.max_iterations,
        "tool loop exhausted its iteration budget"
    );
    outcome.failure = Some(SagaError::IterationBudgetExceeded);
    outcome
}

async fn dispatch(
    catalog: &ToolCatalog,
    name: &str,
    arguments: &serde_json::Value,
    config: ToolLoopConfig,
) -> (String, StepStatus) {
    let Some(spec) = catalog.get(name) else {
        return (
            format!("Error: unknown tool '{name}'. Only the advertised tools are available."),
            StepStatus::Error,
        );
    };

    if let Err(reason) = validate_args(&spec.definition.parameters, arguments) {
        return (
            format!("Error: invalid arguments for '{name}': {reason}"),
            StepStatus::Error,
        );
    }

    match tokio::time::timeout(config.tool_call_timeout, spec.handler.call(arguments.clone()))
        .await
    {
        Ok(Ok(response)) => (response, StepStatus::Success),
        Ok(Err(e)) => (format!("Error: {e}"), StepStatus::Error),
        Err(_) => (
            format!("Error: tool '{name}' timed out"),
            StepStatus::Error,
        ),
    }
}
