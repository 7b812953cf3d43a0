//! Name → constructor registry of strategies.
//!
//! Hosts pick a strategy by name at startup (for example from a CLI flag) and never see the
//! concrete type afterwards.

use crate::config::StrategyConfig;
use crate::error::{Result, StrategyError};
use crate::strategy::Strategy;
use hvd_core::distributed::CollectiveBackend;
use hvd_core::TensorElem;
use std::collections::BTreeMap;
use std::fmt;

/// Builds a strategy over `backend`.
pub type StrategyConstructor<T, B> = fn(B, &StrategyConfig) -> Result<Box<dyn Strategy<T>>>;

pub struct StrategyEntry<T: TensorElem, B: CollectiveBackend> {
    pub description: String,
    pub constructor: StrategyConstructor<T, B>,
}

impl<T: TensorElem, B: CollectiveBackend> fmt::Debug for StrategyEntry<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyEntry")
            .field("description", &self.description)
            .finish()
    }
}

pub struct StrategyRegistry<T: TensorElem, B: CollectiveBackend> {
    entries: BTreeMap<String, StrategyEntry<T, B>>,
}

impl<T: TensorElem, B: CollectiveBackend> StrategyRegistry<T, B> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Adds `name`.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::DuplicateStrategy` if `name` is taken and `override_existing`
    /// is false.
    pub fn register(
        &mut self,
        name: &str,
        constructor: StrategyConstructor<T, B>,
        description: &str,
        override_existing: bool,
    ) -> Result<()> {
        if self.entries.contains_key(name) && !override_existing {
            return Err(StrategyError::DuplicateStrategy(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            StrategyEntry {
                description: description.to_string(),
                constructor,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StrategyEntry<T, B>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<StrategyEntry<T, B>> {
        self.entries.remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Constructs the strategy registered as `name`.
    pub fn create(
        &self,
        name: &str,
        backend: B,
        config: &StrategyConfig,
    ) -> Result<Box<dyn Strategy<T>>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StrategyError::UnknownStrategy {
                name: name.to_string(),
                available: self.entries.keys().cloned().collect(),
            })?;
        (entry.constructor)(backend, config)
    }
}

impl<T: TensorElem, B: CollectiveBackend> Default for StrategyRegistry<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElem, B: CollectiveBackend> fmt::Debug for StrategyRegistry<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
