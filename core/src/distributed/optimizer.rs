//! Gradient-synchronizing optimizer wrapper.
//!
//! [`DistributedOptimizer`] decorates any [`Optimizer`] so that the gradients of its parameters
//! are all-reduced across ranks before the wrapped optimizer steps. With gradient accumulation,
//! several backward passes feed one step; the all-reduce then runs once, after the last of them.
//!
//! ```text
//! backward ─► backward_pass_completed() ─┐  (×N)
//!                                        ▼
//!                         pass N reached: ready
//!                                        │
//!            skip scope open? ── no ──► all-reduce now
//!                   │
//!                  yes ──► wait for an explicit synchronize()
//!                                        │
//!                                 step() ─► inner.step()
//! ```

use super::backend::{CollectiveBackend, ReduceOp};
use crate::error::Result;
use crate::nn::{ParamId, Parameter};
use crate::optim::{Optimizer, OptimizerState, ParamGroup};
use crate::tensor::TensorElem;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Operations of an optimizer that synchronizes gradients across ranks.
pub trait SynchronizedOptimizer: Send {
    /// Records that one backward pass finished producing gradients.
    fn backward_pass_completed(&mut self) -> Result<()>;

    /// All-reduces gradients if an accumulation window is complete; otherwise does nothing.
    fn synchronize(&mut self) -> Result<()>;

    /// Stops [`Optimizer::step`] from synchronizing until the returned guard is dropped.
    fn skip_synchronize(&self) -> SkipSynchronizeGuard;

    /// Whether at least one skip guard is alive.
    fn is_skipping(&self) -> bool;

    fn backward_passes_per_step(&self) -> usize;
}

/// RAII scope during which `step()` leaves gradient synchronization to the caller.
///
/// Guards nest: the optimizer skips until the last one is dropped.
#[must_use = "synchronization is skipped only while the guard is alive"]
pub struct SkipSynchronizeGuard {
    depth: Arc<AtomicUsize>,
}

impl SkipSynchronizeGuard {
    fn open(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self {
            depth: Arc::clone(depth),
        }
    }
}

impl Drop for SkipSynchronizeGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for SkipSynchronizeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipSynchronizeGuard")
            .field("depth", &self.depth.load(Ordering::SeqCst))
            .finish()
    }
}

/// An optimizer whose gradients are all-reduced across ranks before each step.
pub struct DistributedOptimizer<T: TensorElem, B: CollectiveBackend> {
    inner: Box<dyn Optimizer<T>>,
    backend: B,
    /// Parameters to synchronize, sorted by name so every rank issues collectives in one order.
    named_parameters: Vec<(String, Parameter<T>)>,
    backward_passes_per_step: usize,
    op: ReduceOp,
    passes: usize,
    ready: bool,
    synchronized: bool,
    skip_depth: Arc<AtomicUsize>,
}

impl<T: TensorElem, B: CollectiveBackend> DistributedOptimizer<T, B> {
    /// Wraps `inner`.
    ///
    /// # Arguments
    ///
    /// * `backward_passes_per_step` - Backward passes accumulated per step (at least 1).
    /// * `named_parameters` - Names for the parameters `inner` updates. Pairs naming parameters
    ///   `inner` does not own are ignored; owned parameters without a name are synchronized
    ///   under a generated `allreduce.noname.{group}.{index}` name.
    pub fn new(
        inner: Box<dyn Optimizer<T>>,
        backend: B,
        backward_passes_per_step: usize,
        named_parameters: Vec<(String, Parameter<T>)>,
    ) -> Self {
        let owned = inner.param_ids();
        // A tied parameter is reduced once, under the first name it was listed with.
        let mut seen: HashSet<ParamId> = HashSet::new();
        let mut named: Vec<(String, Parameter<T>)> = named_parameters
            .into_iter()
            .filter(|(_, p)| owned.contains(&p.id()) && seen.insert(p.id()))
            .collect();

        for (g, group) in inner.param_groups().iter().enumerate() {
            for (i, param) in group.params.iter().enumerate() {
                if seen.insert(param.id()) {
                    named.push((format!("allreduce.noname.{g}.{i}"), param.clone()));
                }
            }
        }
        named.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            inner,
            backend,
            named_parameters: named,
            backward_passes_per_step: backward_passes_per_step.max(1),
            op: ReduceOp::Average,
            passes: 0,
            ready: false,
            synchronized: false,
            skip_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets how gradients are combined across ranks (default [`ReduceOp::Average`]).
    pub fn with_op(mut self, op: ReduceOp) -> Self {
        self.op = op;
        self
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    pub fn named_parameters(&self) -> &[(String, Parameter<T>)] {
        &self.named_parameters
    }

    /// Backward passes recorded in the current accumulation window.
    pub fn pending_passes(&self) -> usize {
        self.passes
    }

    pub fn inner(&self) -> &dyn Optimizer<T> {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn Optimizer<T>> {
        self.inner
    }

    fn allreduce_grads(&mut self) -> Result<()> {
        debug!(
            rank = self.backend.rank(),
            params = self.named_parameters.len(),
            op = %self.op,
            "allreduce gradients"
        );
        for (name, param) in &self.named_parameters {
            // A parameter untouched by this rank's backward still takes part with zeros.
            let grad = param.grad().unwrap_or_else(|| param.value().zeros_like());
            let reduced = self.backend.allreduce(&grad, self.op)?;
            trace!(name = name.as_str(), "gradient reduced");
            param.set_grad(Some(reduced));
        }
        self.passes = 0;
        self.ready = false;
        self.synchronized = true;
        Ok(())
    }
}

impl<T: TensorElem, B: CollectiveBackend> SynchronizedOptimizer for DistributedOptimizer<T, B> {
    fn backward_pass_completed(&mut self) -> Result<()> {
        self.passes += 1;
        if self.passes < self.backward_passes_per_step {
            trace!(
                passes = self.passes,
                of = self.backward_passes_per_step,
                "accumulating"
            );
            return Ok(());
        }
        self.ready = true;
        if !self.is_skipping() {
            self.allreduce_grads()?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        if !self.ready {
            return Ok(());
        }
        self.allreduce_grads()
    }

    fn skip_synchronize(&self) -> SkipSynchronizeGuard {
        SkipSynchronizeGuard::open(&self.skip_depth)
    }

    fn is_skipping(&self) -> bool {
        self.skip_depth.load(Ordering::SeqCst) > 0
    }

    fn backward_passes_per_step(&self) -> usize {
        self.backward_passes_per_step
    }
}

impl<T: TensorElem, B: CollectiveBackend> Optimizer<T> for DistributedOptimizer<T, B> {
    fn param_groups(&self) -> &[ParamGroup<T>] {
        self.inner.param_groups()
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup<T>] {
        self.inner.param_groups_mut()
    }

    fn step(&mut self) -> Result<()> {
        if !self.is_skipping() {
            if self.synchronized {
                warn!(
                    "step() called after an explicit synchronize() outside a skip_synchronize() \
                     scope; gradients are not reduced a second time"
                );
            } else {
                self.synchronize()?;
            }
        }
        self.inner.step()?;
        self.synchronized = false;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    fn state_dict(&self) -> OptimizerState<T> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &OptimizerState<T>) -> Result<()> {
        self.inner.load_state_dict(state)
    }

    fn as_synchronized(&mut self) -> Option<&mut dyn SynchronizedOptimizer> {
        Some(self)
    }
}

impl<T: TensorElem, B: CollectiveBackend> fmt::Debug for DistributedOptimizer<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedOptimizer")
            .field("params", &self.named_parameters.len())
            .field("backward_passes_per_step", &self.backward_passes_per_step)
            .field("op", &self.op)
            .field("passes", &self.passes)
            .field("skipping", &self.is_skipping())
            .finish()
    }
}
