use crate::distributed::CollectiveError;
use crate::tensor::TensorError;
use thiserror::Error;

/// Umbrella error for operations that mix tensor math, optimizer state and collectives.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    /// An optimizer state dict does not fit the optimizer it is loaded into.
    #[error("Optimizer state mismatch: {0}")]
    StateMismatch(String),

    /// A state dict names a parameter the module does not have.
    #[error("Unknown parameter `{0}`")]
    UnknownParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
