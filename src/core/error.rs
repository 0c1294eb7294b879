use thiserror::Error;

/// Faults raised before or outside a simulation run.
///
/// An infeasible plan is not an error: it is reported through
/// `SimulationResult::ok` and `SearchOutcome::Exhausted`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
