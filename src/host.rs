//! The contract between a training host and a strategy.
//!
//! The host owns the training loop, the model and the recipe for its optimizers. A strategy
//! asks the host for that recipe during setup and hands the resulting optimizers back through
//! its own step methods.

use crate::error::Result;
use hvd_core::data::DistributedSampler;
use hvd_core::optim::LrScheduler;
use hvd_core::{Module, Optimizer, TensorElem};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hooks a training host exposes to a strategy.
pub trait TrainingHost<T: TensorElem> {
    /// Whether the host is fitting (as opposed to validating or predicting).
    fn is_training(&self) -> bool;

    /// Backward passes accumulated before each optimizer step.
    fn accumulate_grad_batches(&self) -> usize {
        1
    }

    /// Builds the optimizers and schedulers for `model`.
    fn configure_optimizers(&self, model: &dyn Module<T>) -> Result<OptimizerConfig<T>>;
}

/// Optimizers and schedulers returned by [`TrainingHost::configure_optimizers`].
pub struct OptimizerConfig<T: TensorElem> {
    pub optimizers: Vec<HostOptimizer<T>>,
    pub lr_schedulers: Vec<LrSchedulerConfig>,
}

impl<T: TensorElem> OptimizerConfig<T> {
    pub fn new() -> Self {
        Self {
            optimizers: Vec::new(),
            lr_schedulers: Vec::new(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: impl Optimizer<T> + 'static) -> Self {
        self.optimizers.push(HostOptimizer::new(Box::new(optimizer)));
        self
    }

    pub fn with_scheduler(mut self, scheduler: LrSchedulerConfig) -> Self {
        self.lr_schedulers.push(scheduler);
        self
    }
}

impl<T: TensorElem> Default for OptimizerConfig<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The host's own decoration of an optimizer: it counts steps for progress tracking.
///
/// Strategies unwrap it with [`HostOptimizer::into_inner`] before rescaling or wrapping.
pub struct HostOptimizer<T: TensorElem> {
    inner: Box<dyn Optimizer<T>>,
    steps: u64,
}

impl<T: TensorElem> HostOptimizer<T> {
    pub fn new(inner: Box<dyn Optimizer<T>>) -> Self {
        Self { inner, steps: 0 }
    }

    pub fn step(&mut self) -> Result<()> {
        self.inner.step()?;
        self.steps += 1;
        Ok(())
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn inner(&self) -> &dyn Optimizer<T> {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn Optimizer<T>> {
        self.inner
    }
}

impl<T: TensorElem> fmt::Debug for HostOptimizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostOptimizer")
            .field("lrs", &self.inner.lrs())
            .field("steps", &self.steps)
            .finish()
    }
}

/// When a scheduler advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Step,
    #[default]
    Epoch,
}

/// A scheduler plus how the host drives it.
pub struct LrSchedulerConfig {
    pub scheduler: Box<dyn LrScheduler>,
    /// Index of the optimizer whose groups the scheduler updates.
    pub optimizer_idx: usize,
    pub interval: Interval,
    /// Advance once every `frequency` intervals.
    pub frequency: usize,
    ticks: usize,
}

impl LrSchedulerConfig {
    pub fn new(scheduler: impl LrScheduler + 'static) -> Self {
        Self {
            scheduler: Box::new(scheduler),
            optimizer_idx: 0,
            interval: Interval::default(),
            frequency: 1,
            ticks: 0,
        }
    }

    pub fn with_optimizer_idx(mut self, optimizer_idx: usize) -> Self {
        self.optimizer_idx = optimizer_idx;
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.frequency = frequency.max(1);
        self
    }

    /// Counts one `interval` and reports whether the scheduler is due.
    pub(crate) fn tick(&mut self, interval: Interval) -> bool {
        if interval != self.interval {
            return false;
        }
        self.ticks += 1;
        self.ticks % self.frequency == 0
    }
}

impl fmt::Debug for LrSchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LrSchedulerConfig")
            .field("base_lrs", &self.scheduler.base_lrs())
            .field("optimizer_idx", &self.optimizer_idx)
            .field("interval", &self.interval)
            .field("frequency", &self.frequency)
            .finish()
    }
}

/// Arguments the host's data layer needs to shard the dataset per rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSamplerKwargs {
    pub num_replicas: usize,
    pub rank: usize,
}

impl DistributedSamplerKwargs {
    /// A shuffling [`DistributedSampler`] for these arguments.
    pub fn sampler(&self) -> Result<DistributedSampler> {
        Ok(DistributedSampler::new(self.num_replicas, self.rank)?)
    }
}
