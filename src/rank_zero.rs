//! Rank-zero-only logging.
//!
//! Every rank runs the same code, so lifecycle messages would otherwise print once per rank.
//! The strategy publishes its global rank here when it is constructed; the macros below emit
//! only when that rank is 0 (or when no rank has been published yet).

use std::cell::Cell;

thread_local! {
    static RANK: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Records the global rank of the calling process.
pub fn set_rank(rank: usize) {
    RANK.with(|r| r.set(Some(rank)));
}

pub fn rank() -> Option<usize> {
    RANK.with(|r| r.get())
}

pub fn is_rank_zero() -> bool {
    rank().unwrap_or(0) == 0
}

/// `tracing::info!`, on rank 0 only.
#[macro_export]
macro_rules! rank_zero_info {
    ($($arg:tt)*) => {
        if $crate::rank_zero::is_rank_zero() {
            $crate::__tracing::info!($($arg)*);
        }
    };
}

/// `tracing::warn!`, on rank 0 only.
#[macro_export]
macro_rules! rank_zero_warn {
    ($($arg:tt)*) => {
        if $crate::rank_zero::is_rank_zero() {
            $crate::__tracing::warn!($($arg)*);
        }
    };
}

/// `tracing::debug!`, on rank 0 only.
#[macro_export]
macro_rules! rank_zero_debug {
    ($($arg:tt)*) => {
        if $crate::rank_zero::is_rank_zero() {
            $crate::__tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_per_thread() {
        assert!(is_rank_zero());
        set_rank(3);
        assert_eq!(rank(), Some(3));
        assert!(!is_rank_zero());

        let other = std::thread::spawn(rank).join().unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn test_macros_expand() {
        set_rank(0);
        rank_zero_info!(world_size = 2, "visible");
        rank_zero_warn!("visible");
        set_rank(1);
        rank_zero_debug!("suppressed");
    }
}
