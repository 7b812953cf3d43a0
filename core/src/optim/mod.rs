//! Optimizers and learning-rate schedulers.
//!
//! Optimizers own **parameter groups**: each group is a list of shared [`Parameter`] handles and
//! a learning rate. A distributed strategy edits group learning rates in place (linear scaling by
//! world size), broadcasts optimizer state between ranks, and decorates optimizers so that
//! stepping synchronizes gradients first.

pub mod adamw;
pub mod scheduler;
pub mod sgd;

pub use adamw::AdamW;
pub use scheduler::{CosineDecay, LinearWarmup, LrScheduler, ReduceLrOnPlateau};
pub use sgd::Sgd;

use crate::distributed::SynchronizedOptimizer;
use crate::error::{Error, Result};
use crate::nn::{ParamId, Parameter};
use crate::tensor::{Tensor, TensorElem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A set of parameters updated with the same learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup<T: TensorElem> {
    pub params: Vec<Parameter<T>>,
    pub lr: f64,
}

impl<T: TensorElem> ParamGroup<T> {
    pub fn new(params: Vec<Parameter<T>>, lr: f64) -> Self {
        Self { params, lr }
    }
}

/// Per-group hyperparameters carried in an [`OptimizerState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub lr: f64,
}

/// Serializable optimizer state.
///
/// Buffers are keyed `"{group}.{index}.{buffer}"` by parameter *position*, not identity, so the
/// state produced on one rank can be loaded on any other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct OptimizerState<T: TensorElem> {
    pub groups: Vec<GroupState>,
    pub buffers: BTreeMap<String, Tensor<T>>,
    pub steps: u64,
}

impl<T: TensorElem> OptimizerState<T> {
    pub(crate) fn buffer_key(group: usize, index: usize, buffer: &str) -> String {
        format!("{group}.{index}.{buffer}")
    }
}

/// A trait for optimizers (e.g., SGD, AdamW).
///
/// Optimizers update the parameters of their groups from the gradients stored on those
/// parameters.
pub trait Optimizer<T: TensorElem>: Send {
    fn param_groups(&self) -> &[ParamGroup<T>];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup<T>];

    /// Performs a single optimization step over every parameter that has a gradient.
    ///
    /// # Errors
    ///
    /// Returns an error if a gradient does not match its parameter's shape, or if a
    /// decorated optimizer fails to synchronize gradients first.
    fn step(&mut self) -> Result<()>;

    /// Clears the gradient of every parameter in every group.
    fn zero_grad(&mut self) {
        for group in self.param_groups() {
            for param in &group.params {
                param.zero_grad();
            }
        }
    }

    fn state_dict(&self) -> OptimizerState<T>;

    /// Replaces the optimizer state (group learning rates and buffers).
    ///
    /// # Errors
    ///
    /// Returns `Error::StateMismatch` if the group count differs.
    fn load_state_dict(&mut self, state: &OptimizerState<T>) -> Result<()>;

    /// Gradient-synchronizing view of this optimizer.
    ///
    /// Only optimizers produced by the distributed wrapper return `Some`; this is how a strategy
    /// recognizes an optimizer that must not be wrapped again.
    fn as_synchronized(&mut self) -> Option<&mut dyn SynchronizedOptimizer> {
        None
    }

    /// Identity of every parameter this optimizer updates.
    fn param_ids(&self) -> HashSet<ParamId> {
        self.param_groups()
            .iter()
            .flat_map(|group| group.params.iter().map(Parameter::id))
            .collect()
    }

    /// Current learning rate of every group.
    fn lrs(&self) -> Vec<f64> {
        self.param_groups().iter().map(|group| group.lr).collect()
    }
}

/// Applies the group learning rates from `state`, checking the group count.
pub(crate) fn load_group_lrs<T: TensorElem>(
    groups: &mut [ParamGroup<T>],
    state: &OptimizerState<T>,
) -> Result<()> {
    if groups.len() != state.groups.len() {
        return Err(Error::StateMismatch(format!(
            "expected {} param groups, got {}",
            groups.len(),
            state.groups.len()
        )));
    }
    for (group, saved) in groups.iter_mut().zip(&state.groups) {
        group.lr = saved.lr;
    }
    Ok(())
}

pub(crate) fn group_states<T: TensorElem>(groups: &[ParamGroup<T>]) -> Vec<GroupState> {
    groups.iter().map(|g| GroupState { lr: g.lr }).collect()
}

/// Converts a learning rate into the element type.
pub(crate) fn lr_as<T: TensorElem>(lr: f64) -> Result<T> {
    T::from_f64(lr).ok_or_else(|| {
        crate::tensor::TensorError::Conversion(format!("learning rate {lr}")).into()
    })
}
