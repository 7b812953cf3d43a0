//! Model-side abstractions: the [`Module`] trait and shared [`Parameter`] handles.

pub mod module;
pub mod parameter;

pub use module::{Module, StateDict};
pub use parameter::{ParamId, Parameter};
