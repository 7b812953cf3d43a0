//! Training strategies.
//!
//! A [`Strategy`] is what a training host talks to when it needs anything distributed: where the
//! model lives, how gradients are synchronized, how values are combined across ranks. The trait
//! is object-safe so a host can hold a `Box<dyn Strategy<T>>` chosen by name at startup; the
//! collective backend a strategy drives is fixed by generics when it is constructed.

pub mod horovod;

pub use horovod::{HorovodStrategy, SyncScopeStack};

use crate::error::{Result, StrategyError};
use crate::host::{DistributedSamplerKwargs, Interval, LrSchedulerConfig, TrainingHost};
use hvd_core::distributed::{ProcessGroup, ReduceOp};
use hvd_core::{Device, Module, Optimizer, Tensor, TensorElem};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A value handed to [`Strategy::reduce`].
///
/// Hosts reduce logged values uniformly; anything that is not a tensor passes through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducible<T: TensorElem> {
    Tensor(Tensor<T>),
    Value(serde_json::Value),
}

impl<T: TensorElem> Reducible<T> {
    pub fn as_tensor(&self) -> Option<&Tensor<T>> {
        match self {
            Reducible::Tensor(t) => Some(t),
            Reducible::Value(_) => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor<T>> {
        match self {
            Reducible::Tensor(t) => Some(t),
            Reducible::Value(_) => None,
        }
    }
}

impl<T: TensorElem> From<Tensor<T>> for Reducible<T> {
    fn from(tensor: Tensor<T>) -> Self {
        Reducible::Tensor(tensor)
    }
}

impl<T: TensorElem> From<serde_json::Value> for Reducible<T> {
    fn from(value: serde_json::Value) -> Self {
        Reducible::Value(value)
    }
}

/// The `reduce_op` argument of [`Strategy::reduce`]: an operator or a string token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReduceOpArg {
    /// Average.
    #[default]
    Default,
    Op(ReduceOp),
    Token(String),
}

impl ReduceOpArg {
    /// Maps the argument onto the ops a strategy reduce supports: average and sum.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::UnrecognizedReduceOp` for any other token or operator.
    pub fn resolve(&self) -> Result<ReduceOp> {
        match self {
            ReduceOpArg::Default => Ok(ReduceOp::Average),
            ReduceOpArg::Op(op @ (ReduceOp::Average | ReduceOp::Sum)) => Ok(*op),
            ReduceOpArg::Op(op) => Err(StrategyError::UnrecognizedReduceOp(op.to_string())),
            ReduceOpArg::Token(token) => match token.as_str() {
                "mean" | "avg" => Ok(ReduceOp::Average),
                "sum" => Ok(ReduceOp::Sum),
                _ => Err(StrategyError::UnrecognizedReduceOp(token.clone())),
            },
        }
    }
}

impl From<ReduceOp> for ReduceOpArg {
    fn from(op: ReduceOp) -> Self {
        ReduceOpArg::Op(op)
    }
}

impl From<&str> for ReduceOpArg {
    fn from(token: &str) -> Self {
        ReduceOpArg::Token(token.to_string())
    }
}

impl<A: Into<ReduceOpArg>> From<Option<A>> for ReduceOpArg {
    fn from(arg: Option<A>) -> Self {
        arg.map_or(ReduceOpArg::Default, Into::into)
    }
}

/// Everything a training host needs from a distributed strategy.
pub trait Strategy<T: TensorElem>: Send {
    /// Registry name.
    fn name(&self) -> &'static str;

    fn global_rank(&self) -> usize;

    fn local_rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_global_zero(&self) -> bool {
        self.global_rank() == 0
    }

    fn parallel_devices(&self) -> &[Device];

    /// The device this rank binds to.
    fn root_device(&self) -> Result<Device>;

    fn distributed_sampler_kwargs(&self) -> DistributedSamplerKwargs {
        DistributedSamplerKwargs {
            num_replicas: self.world_size(),
            rank: self.global_rank(),
        }
    }

    /// Whether the host should leave gradient-accumulation bookkeeping to the strategy.
    fn handles_gradient_accumulation(&self) -> bool;

    /// Default source rank of [`BroadcastExt::broadcast_from_root`].
    fn root_rank(&self) -> usize {
        0
    }

    /// Hands the model to the strategy.
    fn connect(&mut self, model: Arc<dyn Module<T>>);

    fn model(&self) -> Option<Arc<dyn Module<T>>>;

    fn model_to_device(&mut self) -> Result<()>;

    /// Prepares model and optimizers before training starts.
    fn setup(&mut self, host: &dyn TrainingHost<T>) -> Result<()>;

    fn optimizers(&self) -> &[Box<dyn Optimizer<T>>];

    fn lr_scheduler_configs(&self) -> &[LrSchedulerConfig];

    /// Runs `closure` to compute gradients from `loss`, then lets the strategy react.
    fn backward(
        &mut self,
        loss: &Tensor<T>,
        closure: &mut dyn FnMut(&Tensor<T>) -> Result<()>,
    ) -> Result<()>;

    /// Called after every backward pass, before any optimizer step.
    fn post_backward(&mut self, loss: &Tensor<T>) -> Result<()>;

    fn optimizer_step(&mut self, optimizer_idx: usize) -> Result<()>;

    fn zero_grad(&mut self);

    /// Advances the schedulers driven at `interval` and applies their rates.
    fn lr_scheduler_step(&mut self, interval: Interval, metric: Option<f64>) -> Result<()>;

    /// Blocks until every rank reaches the barrier.
    fn barrier(&self, name: Option<&str>) -> Result<()>;

    /// Combines `value` across ranks.
    fn reduce(
        &self,
        value: Reducible<T>,
        group: Option<&ProcessGroup>,
        reduce_op: ReduceOpArg,
    ) -> Result<Reducible<T>>;

    /// Collects `tensor` from every rank, ordered by rank.
    fn all_gather(
        &self,
        tensor: &Tensor<T>,
        group: Option<&ProcessGroup>,
        sync_grads: bool,
    ) -> Result<Vec<Tensor<T>>>;

    /// Returns `src`'s payload on every rank.
    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>>;

    /// Releases everything `setup` acquired. Safe to call without setup, and more than once.
    fn teardown(&mut self) -> Result<()>;
}

/// Object broadcast for every [`Strategy`].
///
/// Kept out of `Strategy` itself because generic methods would make the trait unusable as
/// `dyn Strategy<T>`.
pub trait BroadcastExt<T: TensorElem>: Strategy<T> {
    /// Returns `src`'s `obj` on every rank. Every rank must call it.
    fn broadcast<O>(&self, obj: &O, src: usize) -> Result<O>
    where
        O: Serialize + DeserializeOwned,
    {
        let payload = if self.global_rank() == src {
            serde_json::to_vec(obj)?
        } else {
            Vec::new()
        };
        let received = self.broadcast_bytes(payload, src)?;
        Ok(serde_json::from_slice(&received)?)
    }

    /// [`broadcast`](BroadcastExt::broadcast) from [`Strategy::root_rank`].
    fn broadcast_from_root<O>(&self, obj: &O) -> Result<O>
    where
        O: Serialize + DeserializeOwned,
    {
        self.broadcast(obj, self.root_rank())
    }
}

impl<T: TensorElem, S: Strategy<T> + ?Sized> BroadcastExt<T> for S {}
