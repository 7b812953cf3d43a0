use super::backend::{CollectiveBackend, CollectiveError, Result};
use super::cpu_backend::CpuBackend;
use std::thread;

/// Runs `f` once per rank of an in-process world, each rank on its own thread.
///
/// Threads are named `rank-{n}`. Results come back ordered by rank. Backends are handed out
/// uninitialized; `f` decides when to call `init`.
///
/// # Errors
///
/// Returns `CollectiveError::Spawn` if a thread cannot be started, or
/// `CollectiveError::RankPanicked` for the lowest rank whose closure panicked.
///
/// # Example
///
/// ```rust
/// use hvd_core::distributed::{run_local_world, CollectiveBackend};
///
/// let ranks = run_local_world(4, 4, |backend| backend.rank()).unwrap();
/// assert_eq!(ranks, vec![0, 1, 2, 3]);
/// ```
pub fn run_local_world<R, F>(world_size: usize, local_size: usize, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(CpuBackend) -> R + Sync,
{
    thread::scope(|scope| {
        let f = &f;
        let mut handles = Vec::with_capacity(world_size);
        for backend in CpuBackend::ring_with_local_size(world_size, local_size) {
            let rank = backend.rank();
            let handle = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || f(backend))
                .map_err(|source| CollectiveError::Spawn { rank, source })?;
            handles.push((rank, handle));
        }

        // Join every rank before reporting, so no panicked thread is left unjoined.
        let joined: Vec<Result<R>> = handles
            .into_iter()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .map_err(|_| CollectiveError::RankPanicked(rank))
            })
            .collect();
        joined.into_iter().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ReduceOp;
    use crate::tensor::Tensor;

    #[test]
    fn test_results_in_rank_order() {
        let names = run_local_world(3, 3, |_| {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(
            names,
            vec![
                Some("rank-0".to_string()),
                Some("rank-1".to_string()),
                Some("rank-2".to_string())
            ]
        );
    }

    #[test]
    fn test_world_runs_collectives() {
        let sums = run_local_world(4, 2, |backend| {
            backend.init().unwrap();
            let t = Tensor::<f32>::full(&[3], backend.rank() as f32);
            backend.allreduce(&t, ReduceOp::Sum).unwrap().data().to_vec()
        })
        .unwrap();
        for sum in sums {
            assert_eq!(sum, vec![6.0, 6.0, 6.0]);
        }
    }

    #[test]
    fn test_panicking_rank() {
        let result = run_local_world(2, 2, |backend| {
            if backend.rank() == 1 {
                panic!("rank 1 fails");
            }
        });
        assert!(matches!(result, Err(CollectiveError::RankPanicked(1))));
    }
}
