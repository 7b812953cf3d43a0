use crate::tensor::{Tensor, TensorElem, TensorError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by collective backends.
///
/// These are *backend* errors: a strategy never translates or retries them.
#[derive(Error, Debug)]
pub enum CollectiveError {
    /// A collective was issued before [`CollectiveBackend::init`].
    #[error("collective backend is not initialized; call init() first")]
    NotInitialized,

    /// A peer hung up mid-collective.
    #[error("rank {rank}: ring peer disconnected during {op}")]
    Disconnected { rank: usize, op: &'static str },

    /// A peer sent a frame that does not belong to the collective in progress.
    #[error("rank {rank}: protocol violation during {op}: {detail}")]
    Protocol {
        rank: usize,
        op: &'static str,
        detail: String,
    },

    /// A rank index outside `0..world_size` was supplied.
    #[error("rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    /// A rank thread panicked before returning.
    #[error("rank {0} panicked")]
    RankPanicked(usize),

    #[error("failed to spawn rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("object serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, CollectiveError>;

/// How values from all ranks are combined by an all-reduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Average,
    Min,
    Max,
    Product,
}

impl ReduceOp {
    /// Combines two partial results.
    ///
    /// `Average` combines like `Sum`; the division by the world size happens once at the end.
    pub fn combine(self, acc: f64, value: f64) -> f64 {
        match self {
            ReduceOp::Sum | ReduceOp::Average => acc + value,
            ReduceOp::Min => acc.min(value),
            ReduceOp::Max => acc.max(value),
            ReduceOp::Product => acc * value,
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Average => "mean",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::Product => "product",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized reduce op `{0}`")]
pub struct ParseReduceOpError(pub String);

impl FromStr for ReduceOp {
    type Err = ParseReduceOpError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "mean" | "avg" | "average" => Ok(ReduceOp::Average),
            "min" => Ok(ReduceOp::Min),
            "max" => Ok(ReduceOp::Max),
            "product" | "prod" => Ok(ReduceOp::Product),
            _ => Err(ParseReduceOpError(s.to_string())),
        }
    }
}

/// The set of ranks a collective runs over.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ProcessGroup {
    /// Every rank in the job.
    #[default]
    World,
    /// An explicit subset of global ranks.
    Ranks(Vec<usize>),
}

impl ProcessGroup {
    pub fn is_world(&self) -> bool {
        matches!(self, ProcessGroup::World)
    }
}

/// Abstraction for a distributed communication backend.
///
/// This trait allows swapping between different communication implementations:
/// - **NCCL/MPI**: Optimized for GPU clusters.
/// - **CPU/Ring**: [`CpuBackend`](super::cpu_backend::CpuBackend), every rank a thread.
///
/// Every collective is blocking: it returns only once every rank in the world has issued the
/// matching call, in the same order.
pub trait CollectiveBackend: Send + Sync {
    /// Initializes the backend. Calling it again is a no-op.
    fn init(&self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Whether a multi-rank group is up: initialized with more than one rank.
    fn is_distributed(&self) -> bool {
        self.is_initialized() && self.size() > 1
    }

    /// Global rank of the calling process.
    fn rank(&self) -> usize;

    /// Rank of the calling process among the ranks on its host.
    fn local_rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Number of ranks on the calling process's host.
    fn local_size(&self) -> usize;

    /// Blocks until every rank has joined.
    ///
    /// # Arguments
    /// * `device` - Accelerator ordinal the join should run on, `None` for the CPU.
    fn join(&self, device: Option<usize>) -> Result<()>;

    /// Combines `tensor` across all ranks; every rank receives the same result.
    fn allreduce<T: TensorElem>(&self, tensor: &Tensor<T>, op: ReduceOp) -> Result<Tensor<T>>;

    /// Collects one tensor per rank, ordered by ascending global rank.
    ///
    /// Tensors must have at least one dimension.
    fn allgather<T: TensorElem>(&self, tensor: &Tensor<T>) -> Result<Vec<Tensor<T>>>;

    /// Returns `root`'s tensor on every rank.
    fn broadcast<T: TensorElem>(&self, tensor: &Tensor<T>, root: usize) -> Result<Tensor<T>>;

    /// Returns `root`'s payload on every rank.
    fn broadcast_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reduce_op() {
        assert_eq!("sum".parse::<ReduceOp>().unwrap(), ReduceOp::Sum);
        assert_eq!("mean".parse::<ReduceOp>().unwrap(), ReduceOp::Average);
        assert_eq!("avg".parse::<ReduceOp>().unwrap(), ReduceOp::Average);
        assert_eq!("MAX".parse::<ReduceOp>().unwrap(), ReduceOp::Max);
        assert!("median".parse::<ReduceOp>().is_err());
    }

    #[test]
    fn test_combine() {
        assert_eq!(ReduceOp::Sum.combine(1.0, 2.0), 3.0);
        assert_eq!(ReduceOp::Average.combine(1.0, 2.0), 3.0);
        assert_eq!(ReduceOp::Min.combine(1.0, 2.0), 1.0);
        assert_eq!(ReduceOp::Max.combine(1.0, 2.0), 2.0);
        assert_eq!(ReduceOp::Product.combine(3.0, 2.0), 6.0);
    }

    #[test]
    fn test_process_group_default_is_world() {
        assert!(ProcessGroup::default().is_world());
        assert!(!ProcessGroup::Ranks(vec![0, 1]).is_world());
    }
}
