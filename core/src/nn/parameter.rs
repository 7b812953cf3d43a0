//! Trainable parameters shared between a model and its optimizers.
//!
//! A model and the optimizers that update it must see the *same* storage: the optimizer writes
//! new values that the next forward pass reads, and the collective layer overwrites gradients
//! in place. A [`Parameter`] is therefore a cheap, clonable handle to shared state, and its
//! [`ParamId`] is how we ask "is this the same parameter?" without comparing values.

use crate::tensor::{Device, Result, Tensor, TensorElem};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

#[derive(Debug)]
struct ParamState<T: TensorElem> {
    value: Tensor<T>,
    grad: Option<Tensor<T>>,
}

/// A shared handle to a trainable tensor and its gradient.
///
/// Cloning a `Parameter` clones the handle, not the data.
pub struct Parameter<T: TensorElem> {
    id: ParamId,
    state: Arc<RwLock<ParamState<T>>>,
}

impl<T: TensorElem> Parameter<T> {
    pub fn new(value: Tensor<T>) -> Self {
        Self {
            id: ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
            state: Arc::new(RwLock::new(ParamState { value, grad: None })),
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Returns a copy of the current value.
    pub fn value(&self) -> Tensor<T> {
        self.state.read().value.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.state.read().value.shape().to_vec()
    }

    pub fn device(&self) -> Device {
        self.state.read().value.device()
    }

    /// Overwrites the value in place.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `value` has a different shape.
    pub fn set_value(&self, value: &Tensor<T>) -> Result<()> {
        self.state.write().value.copy_from(value)
    }

    /// Runs `f` with mutable access to the value and the current gradient.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tensor<T>, Option<&Tensor<T>>) -> R) -> R {
        let mut state = self.state.write();
        let ParamState { value, grad } = &mut *state;
        f(value, grad.as_ref())
    }

    /// Returns a copy of the current gradient.
    pub fn grad(&self) -> Option<Tensor<T>> {
        self.state.read().grad.clone()
    }

    /// Replaces the gradient.
    pub fn set_grad(&self, grad: Option<Tensor<T>>) {
        self.state.write().grad = grad;
    }

    /// Adds `grad` into the stored gradient, creating it on first use.
    ///
    /// This is what a backward pass does, so gradients from several micro-batches sum up until
    /// the optimizer steps and clears them.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `grad` does not match the parameter shape.
    pub fn accumulate_grad(&self, grad: &Tensor<T>) -> Result<()> {
        let mut state = self.state.write();
        state.value.check_same_shape(grad)?;
        match state.grad.as_mut() {
            Some(existing) => existing.add_assign(grad),
            None => {
                let device = state.value.device();
                state.grad = Some(grad.clone().to_device(device));
                Ok(())
            }
        }
    }

    pub fn zero_grad(&self) {
        self.state.write().grad = None;
    }

    /// Rebinds the value (and gradient, if any) to `device`.
    pub fn to_device(&self, device: Device) {
        let mut state = self.state.write();
        let value = std::mem::replace(&mut state.value, Tensor::zeros(&[]));
        state.value = value.to_device(device);
        if let Some(grad) = state.grad.take() {
            state.grad = Some(grad.to_device(device));
        }
    }
}

impl<T: TensorElem> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: TensorElem> fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Parameter")
            .field("id", &self.id)
            .field("value", &state.value)
            .field("has_grad", &state.grad.is_some())
            .finish()
    }
}
