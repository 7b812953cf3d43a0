use hvd_core::distributed::{CollectiveError, ProcessGroup};
use hvd_core::TensorError;
use thiserror::Error;

/// Errors raised by a training strategy.
///
/// Configuration mistakes (an unsupported process group, an unknown reduce op, a rank without a
/// device) are reported as their own variants so callers can tell them apart from failures of
/// the collective backend, which arrive unchanged inside [`StrategyError::Core`].
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("`{op}` only supports the world process group, got {group:?}")]
    UnsupportedGroup {
        op: &'static str,
        group: ProcessGroup,
    },

    #[error("Unrecognized `reduce_op`: `{0}`; expected one of `mean`, `avg` or `sum`")]
    UnrecognizedReduceOp(String),

    #[error("local rank {local_rank} has no device: only {available} parallel devices configured")]
    DeviceIndexOutOfRange { local_rank: usize, available: usize },

    #[error("a strategy named `{0}` is already registered")]
    DuplicateStrategy(String),

    #[error("no strategy named `{name}`; available: {available:?}")]
    UnknownStrategy {
        name: String,
        available: Vec<String>,
    },

    #[error(transparent)]
    Core(#[from] hvd_core::Error),

    #[error("Failed to extract configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("object serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StrategyError {
    /// Whether this error reports a programming or configuration mistake.
    ///
    /// These are never transient; retrying the same call fails the same way.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            StrategyError::Misconfiguration(_)
                | StrategyError::UnsupportedGroup { .. }
                | StrategyError::UnrecognizedReduceOp(_)
                | StrategyError::DeviceIndexOutOfRange { .. }
                | StrategyError::DuplicateStrategy(_)
                | StrategyError::UnknownStrategy { .. }
                | StrategyError::Config(_)
        )
    }
}

impl From<CollectiveError> for StrategyError {
    fn from(err: CollectiveError) -> Self {
        StrategyError::Core(err.into())
    }
}

impl From<TensorError> for StrategyError {
    fn from(err: TensorError) -> Self {
        StrategyError::Core(err.into())
    }
}

impl From<figment::Error> for StrategyError {
    fn from(err: figment::Error) -> Self {
        StrategyError::Config(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StrategyError>;
