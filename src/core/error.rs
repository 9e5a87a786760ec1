/// Failure taxonomy for the query saga. The `Display` form is what lands in
/// a saga record's `error_message`, so variants render as a stable code
/// followed by optional detail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SagaError {
    #[error("UnsafeStatement: {0}")]
    UnsafeStatement(String),
    #[error("SqlNotProduced")]
    SqlNotProduced,
    #[error("ExecutionFailed: {0}")]
    ExecutionFailed(String),
    #[error("IterationBudgetExceeded")]
    IterationBudgetExceeded,
    #[error("LoopTimeout")]
    LoopTimeout,
    #[error("NoLiveTool: no healthy endpoint for role '{0}'")]
    NoLiveTool(String),
    #[error("StateStoreUnavailable: {0}")]
    StateStoreUnavailable(String),
    #[error("BusUnavailable: {0}")]
    BusUnavailable(String),
    #[error("SagaDeadline")]
    SagaDeadline,
    #[error("Irrelevant: {0}")]
    Irrelevant(String),
    #[error("NoContextAvailable")]
    NoContextAvailable,
    #[error("LlmError: {0}")]
    Llm(String),
}

impl SagaError {
    /// Stable machine-readable code, independent of the detail text.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::UnsafeStatement(_) => "UnsafeStatement",
            SagaError::SqlNotProduced => "SqlNotProduced",
            SagaError::ExecutionFailed(_) => "ExecutionFailed",
            SagaError::IterationBudgetExceeded => "IterationBudgetExceeded",
            SagaError::LoopTimeout => "LoopTimeout",
            SagaError::NoLiveTool(_) => "NoLiveTool",
            SagaError::StateStoreUnavailable(_) => "StateStoreUnavailable",
            SagaError::BusUnavailable(_) => "BusUnavailable",
            SagaError::SagaDeadline => "SagaDeadline",
            SagaError::Irrelevant(_) => "Irrelevant",
            SagaError::NoContextAvailable => "NoContextAvailable",
            SagaError::Llm(_) => "LlmError",
        }
    }

    /// Errors that should be redelivered by the bus rather than written as a
    /// terminal saga state. Everything else is surfaced terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SagaError::NoLiveTool(_)
                | SagaError::StateStoreUnavailable(_)
                | SagaError::BusUnavailable(_)
        )
    }
}
