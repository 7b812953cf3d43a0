//! Core Tensor implementation.
//!
//! # What is a Tensor here?
//!
//! A **Tensor** is a flat buffer of numbers plus a shape. The coordination layer never does
//! heavy math on tensors; it moves them between ranks (all-reduce, all-gather, broadcast),
//! accumulates gradients into them, and lets optimizers update them element-wise.
//!
//! Because a model's parameters, its gradients, the optimizer's buffers and a logged scalar
//! loss all have different ranks, the shape is **dynamic** (`Vec<usize>`), and rank 0 is allowed:
//!
//! - **0D Tensor (Scalar)**: shape `[]`, one element (e.g., a loss value).
//! - **1D Tensor (Vector)**: shape `[n]` (e.g., a bias).
//! - **2D Tensor (Matrix)**: shape `[rows, cols]` (e.g., a weight matrix).
//!
//! ## Example
//!
//! ```rust
//! use hvd_core::tensor::Tensor;
//!
//! let tensor = Tensor::<f32>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//!
//! let loss = Tensor::scalar(0.25f32);
//! assert_eq!(loss.rank(), 0);
//! assert_eq!(loss.reshape(&[1]).unwrap().shape(), &[1]);
//! ```
//!
//! Data is stored **row-major** (C-style): the last dimension changes fastest.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

pub mod device;

pub use device::Device;

/// Error type for Tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// A value could not be represented in the requested element type.
    #[error("Element conversion failed: {0}")]
    Conversion(String),
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory (`Vec<T>`).
/// - `Num + ...`: Provides the arithmetic optimizers and reductions need.
/// - `FromPrimitive + ToPrimitive`: Collectives move values as `f64` on the wire.
/// - `Serialize + DeserializeOwned`: Tensors travel inside broadcast objects (optimizer state).
/// - `Send + Sync + 'static`: Required for parallel execution via `rayon` and rank threads.
pub trait TensorElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + Serialize
    + DeserializeOwned
    + 'static
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
        + Serialize
        + DeserializeOwned
        + 'static
{
}

/// The core Tensor struct.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
///
/// The device tag records where the tensor is *bound*. All data lives in host memory; the tag is
/// what `model_to_device` and the collective backends inspect.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr<T>", bound(deserialize = ""))]
pub struct Tensor<T>
where
    T: TensorElem,
{
    shape: Vec<usize>,
    data: Vec<T>,
    device: Device,
}

/// Unvalidated wire form of a [`Tensor`].
#[derive(Deserialize)]
struct TensorRepr<T> {
    shape: Vec<usize>,
    data: Vec<T>,
    device: Device,
}

impl<T: TensorElem> TryFrom<TensorRepr<T>> for Tensor<T> {
    type Error = TensorError;

    fn try_from(repr: TensorRepr<T>) -> Result<Self> {
        Ok(Tensor::new(repr.data, &repr.shape)?.to_device(repr.device))
    }
}

impl<T> Tensor<T>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape: shape.to_vec(),
            data,
            device: Device::Cpu,
        })
    }

    /// Creates a rank-0 tensor holding a single value.
    pub fn scalar(value: T) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
            device: Device::Cpu,
        }
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; size],
            device: Device::Cpu,
        }
    }

    /// Builds a tensor of the given shape from `f64` values.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Conversion` if a value is not representable as `T`, or
    /// `TensorError::ShapeMismatch` if the value count does not match the shape.
    pub fn from_f64(values: &[f64], shape: &[usize]) -> Result<Self> {
        let data = values
            .iter()
            .map(|v| {
                T::from_f64(*v).ok_or_else(|| TensorError::Conversion(format!("{v} from f64")))
            })
            .collect::<Result<Vec<T>>>()?;
        Self::new(data, shape)
    }

    /// Returns the elements widened to `f64`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Conversion` if an element has no `f64` representation.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.data
            .iter()
            .map(|v| {
                v.to_f64()
                    .ok_or_else(|| TensorError::Conversion(format!("{v:?} to f64")))
            })
            .collect()
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// The number of elements must remain the same. Reshaping a scalar to `[1]` is how
    /// all-gather promotes rank-0 values.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape(self, new_shape: &[usize]) -> Result<Self> {
        let new_size: usize = new_shape.iter().product();
        if self.size() != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.size()],
                got: vec![new_size],
            });
        }

        Ok(Self {
            shape: new_shape.to_vec(),
            data: self.data,
            device: self.device,
        })
    }

    /// Returns the same tensor bound to `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the strides of the tensor.
    ///
    /// Strides represent the number of elements to skip in memory to move to the next element
    /// along a specific dimension.
    pub fn strides(&self) -> Vec<usize> {
        compute_strides(&self.shape)
    }

    /// Returns the device this tensor is bound to.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its flat data.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns a zero tensor with the same shape and device.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shape).to_device(self.device)
    }

    /// Adds `other` into `self` element-wise.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes differ.
    pub fn add_assign(&mut self, other: &Tensor<T>) -> Result<()> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&mut self, factor: T) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    /// Copies the values of `src` into `self`, keeping `self`'s device.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes differ.
    pub fn copy_from(&mut self, src: &Tensor<T>) -> Result<()> {
        self.check_same_shape(src)?;
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    /// Returns an error unless `other` has exactly the same shape.
    pub fn check_same_shape(&self, other: &Tensor<T>) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Computes the row-major strides for a given shape.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T> Debug for Tensor<T>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("data_len", &self.data.len())
            .finish()
    }
}
