//! Data sampling utilities.
//!
//! In data-parallel training each rank must read a different shard of the dataset while every
//! rank agrees on the shuffle. [`DistributedSampler`] handles that; the plain samplers are its
//! single-process counterparts.

pub mod sampler;

pub use sampler::{DistributedSampler, RandomSampler, Sampler, SequentialSampler};
