use thiserror::Error;

/// Everything that can abort a round. None of these are retried.
#[derive(Debug, Error)]
pub enum SbiError {
    /// The proposal could not produce usable parameter draws.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// The simulator failed for one draw; the whole batch is dropped.
    #[error("simulator failed at draw {index}: {message}")]
    Simulator { index: usize, message: String },

    #[error("insufficient data: {available} simulations, at least {required} needed")]
    InsufficientData { available: usize, required: usize },

    #[error("training diverged at epoch {epoch}: non-finite {stage} loss")]
    TrainingDivergence { epoch: usize, stage: &'static str },

    #[error("variational optimization diverged at iteration {iteration}: non-finite divergence estimate")]
    OptimizationDivergence { iteration: usize },

    #[error("the variational posterior has not been fitted")]
    UnfittedPosterior,

    #[error("{what} dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The posterior is fitted at one observation and cannot be
    /// evaluated at another one.
    #[error("observation differs from the one the posterior was fitted at")]
    ObservationMismatch,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SbiError>;

impl From<SbiError> for candle_core::Error {
    fn from(err: SbiError) -> Self {
        match err {
            SbiError::Tensor(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
