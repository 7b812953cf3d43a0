//! # hvd-strategy
//!
//! A data-parallel training strategy that plugs a collective backend into a training host.
//!
//! The host owns the training loop, the model and the recipe for its optimizers. The backend
//! owns rank assignment and the collectives (all-reduce, all-gather, broadcast, join). The
//! strategy translates host lifecycle events into correctly ordered collective calls:
//!
//! - scales learning rates (and scheduler base rates) by the world size,
//! - broadcasts parameters and optimizer state from rank 0 so replicas start identical,
//! - wraps optimizers so gradients are all-reduced exactly once per accumulation window.
//!
//! ## Example
//!
//! ```rust
//! use hvd_core::distributed::run_local_world;
//! use hvd_core::Tensor;
//! use hvd_strategy::{BroadcastExt, HorovodStrategy, Strategy, StrategyConfig};
//!
//! let results = run_local_world(2, 2, |backend| {
//!     let strategy = HorovodStrategy::<f32, _>::new(backend, StrategyConfig::default()).unwrap();
//!     let greeting = if strategy.is_global_zero() { "init" } else { "" };
//!     strategy.broadcast(&greeting.to_string(), 0).unwrap()
//! })
//! .unwrap();
//! assert_eq!(results, vec!["init", "init"]);
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod rank_zero;
pub mod registry;
pub mod strategy;

pub use config::StrategyConfig;
pub use error::{Result, StrategyError};
pub use host::{
    DistributedSamplerKwargs, HostOptimizer, Interval, LrSchedulerConfig, OptimizerConfig,
    TrainingHost,
};
pub use registry::StrategyRegistry;
pub use strategy::{BroadcastExt, HorovodStrategy, ReduceOpArg, Reducible, Strategy};

#[doc(hidden)]
pub use tracing as __tracing;
