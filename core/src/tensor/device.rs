//! Device descriptors and the per-rank active device.
//!
//! # ML Context
//!
//! In data-parallel training every rank owns exactly one device, picked from the list of
//! devices available on its host by the rank's **local rank**:
//! - **CPU**: host memory. Any number of ranks can share it.
//! - **CUDA**: one accelerator per rank. Besides moving the model there, the rank must make the
//!   device its *active* device, otherwise collective kernels launch on the wrong GPU.
//!
//! The active device is process-scoped state. The in-memory backend runs each rank on its own
//! thread, so it is stored per thread.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A device a tensor or a rank can be bound to.
///
/// Parses from and prints as `"cpu"` or `"cuda:N"`.
///
/// ```rust
/// use hvd_core::tensor::Device;
///
/// let device: Device = "cuda:1".parse().unwrap();
/// assert_eq!(device, Device::Cuda(1));
/// assert!(device.is_accelerator());
/// assert_eq!(device.to_string(), "cuda:1");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Returns the name of the device family.
    pub fn name(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
        }
    }

    /// Whether this device is accelerator-class and must be made active before use.
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Accelerator ordinal, `None` for the CPU.
    pub fn index(&self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Cuda(index) => Some(*index),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid device `{0}`, expected `cpu` or `cuda:<index>`")]
pub struct ParseDeviceError(pub String);

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => trimmed
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| ParseDeviceError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

thread_local! {
    static ACTIVE_DEVICE: Cell<Option<Device>> = const { Cell::new(None) };
}

/// Makes `device` the active accelerator for the calling rank.
pub fn set_active_device(device: Device) {
    ACTIVE_DEVICE.with(|active| active.set(Some(device)));
}

/// The accelerator last made active by the calling rank, if any.
pub fn active_device() -> Option<Device> {
    ACTIVE_DEVICE.with(|active| active.get())
}
