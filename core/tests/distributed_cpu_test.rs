use hvd_core::distributed::backend::{CollectiveBackend, CollectiveError, ReduceOp};
use hvd_core::distributed::cpu_backend::CpuBackend;
use hvd_core::distributed::run_local_world;
use hvd_core::tensor::{Device, Tensor};
use std::thread;

#[test]
fn test_ring_all_reduce_cpu() {
    let world_size = 4;
    let mut handles = vec![];

    // Ring 0 -> 1 -> 2 -> 3 -> 0, one thread per rank.
    for backend in CpuBackend::ring(world_size) {
        let handle = thread::spawn(move || {
            backend.init().unwrap();
            let rank = backend.rank();

            // Rank 0 has 1s, Rank 1 has 2s, etc.
            // Sum should be 1+2+3+4 = 10.
            let data = vec![(rank + 1) as f32; 8];
            let tensor = Tensor::<f32>::new(data, &[2, 4]).unwrap();

            let result = backend.allreduce(&tensor, ReduceOp::Sum).unwrap();

            assert_eq!(result.shape(), &[2, 4]);
            for &val in result.data() {
                assert!(
                    (val - 10.0).abs() < 1e-5,
                    "Rank {}: Expected {}, got {}",
                    rank,
                    10.0,
                    val
                );
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_cpu_backend_properties() {
    let ring = CpuBackend::ring_with_local_size(6, 4);
    assert_eq!(ring.len(), 6);
    assert_eq!(ring[5].rank(), 5);
    assert_eq!(ring[5].local_rank(), 1);
    assert_eq!(ring[5].size(), 6);
    assert_eq!(ring[5].local_size(), 4);
}

#[test]
fn test_all_reduce_uneven_chunks() {
    // 5 elements over 4 ranks: chunk size 2 leaves the last chunk empty.
    let results = run_local_world(4, 4, |backend| {
        backend.init().unwrap();
        let data: Vec<f64> = (0..5).map(|i| (i * 10 + backend.rank()) as f64).collect();
        let t = Tensor::new(data, &[5]).unwrap();
        backend.allreduce(&t, ReduceOp::Average).unwrap()
    })
    .unwrap();

    // mean over ranks of (i * 10 + r) = i * 10 + 1.5
    for result in results {
        assert_eq!(result.data(), &[1.5, 11.5, 21.5, 31.5, 41.5]);
    }
}

#[test]
fn test_all_reduce_min_max_scalar() {
    let results = run_local_world(3, 3, |backend| {
        backend.init().unwrap();
        let t = Tensor::scalar(backend.rank() as f32 * 2.0);
        (
            backend.allreduce(&t, ReduceOp::Min).unwrap(),
            backend.allreduce(&t, ReduceOp::Max).unwrap(),
        )
    })
    .unwrap();

    for (min, max) in results {
        assert_eq!(min.rank(), 0);
        assert_eq!(min.data(), &[0.0]);
        assert_eq!(max.data(), &[4.0]);
    }
}

#[test]
fn test_all_reduce_keeps_device() {
    let results = run_local_world(2, 2, |backend| {
        backend.init().unwrap();
        let device = Device::Cuda(backend.local_rank());
        let t = Tensor::<f32>::ones(&[3]).to_device(device);
        backend.allreduce(&t, ReduceOp::Sum).unwrap().device()
    })
    .unwrap();
    assert_eq!(results, vec![Device::Cuda(0), Device::Cuda(1)]);
}

#[test]
fn test_all_gather_rank_order() {
    let results = run_local_world(4, 2, |backend| {
        backend.init().unwrap();
        // Rank r contributes r + 1 rows.
        let rows = backend.rank() + 1;
        let t = Tensor::<i64>::full(&[rows, 2], backend.rank() as i64);
        backend.allgather(&t).unwrap()
    })
    .unwrap();

    for gathered in results {
        assert_eq!(gathered.len(), 4);
        for (rank, t) in gathered.iter().enumerate() {
            assert_eq!(t.shape(), &[rank + 1, 2]);
            assert!(t.data().iter().all(|&v| v == rank as i64));
        }
    }
}

#[test]
fn test_broadcast_from_every_root() {
    for root in 0..3 {
        let results = run_local_world(3, 3, move |backend| {
            backend.init().unwrap();
            let t = Tensor::<f32>::full(&[2], backend.rank() as f32);
            backend.broadcast(&t, root).unwrap()
        })
        .unwrap();
        for t in results {
            assert_eq!(t.data(), &[root as f32, root as f32]);
        }
    }
}

#[test]
fn test_join_then_collectives_stay_aligned() {
    let results = run_local_world(3, 3, |backend| {
        backend.init().unwrap();
        backend.join(None).unwrap();
        let bytes = backend
            .broadcast_bytes(vec![backend.rank() as u8; 4], 1)
            .unwrap();
        backend.join(Some(backend.local_rank())).unwrap();
        let sum = backend
            .allreduce(&Tensor::<f32>::ones(&[1]), ReduceOp::Sum)
            .unwrap();
        (bytes, sum.data()[0])
    })
    .unwrap();

    for (bytes, sum) in results {
        assert_eq!(bytes, vec![1, 1, 1, 1]);
        assert_eq!(sum, 3.0);
    }
}

#[test]
fn test_collective_before_init_fails() {
    let results = run_local_world(2, 2, |backend| {
        backend.allreduce(&Tensor::<f32>::ones(&[1]), ReduceOp::Sum)
    })
    .unwrap();
    for result in results {
        assert!(matches!(result, Err(CollectiveError::NotInitialized)));
    }
}
