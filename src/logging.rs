//! Logging setup.
//!
//! The strategy reports through `tracing`. Hosts that already install a subscriber need nothing
//! from here; everyone else calls [`init`] once. Rank threads are named `rank-{n}` by the
//! in-process launcher, so thread names are printed to tell ranks apart.

use std::sync::Once;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// ENV used to set the log level
pub const FILTER_ENV: &str = "HVD_LOG";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .with_filter(filters());
    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("global subscriber already installed; keeping it");
    }
}

fn filters() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init();
        tracing::info!("logging initialized");
    }
}
