//! Copying state from a root rank to every other rank.
//!
//! Data-parallel replicas must start identical. Before training, parameters and optimizer state
//! are broadcast from one rank (rank 0 by convention) and overwrite whatever the others
//! initialized locally.

use super::backend::{self, CollectiveBackend};
use crate::error::Result;
use crate::nn::Parameter;
use crate::optim::Optimizer;
use crate::tensor::TensorElem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Returns `root`'s `obj` on every rank.
///
/// The object is serialized with `serde_json` on `root` only; the other ranks' `obj` is ignored.
pub fn broadcast_object<B, O>(backend: &B, obj: &O, root: usize) -> backend::Result<O>
where
    B: CollectiveBackend,
    O: Serialize + DeserializeOwned,
{
    let payload = if backend.rank() == root {
        serde_json::to_vec(obj)?
    } else {
        Vec::new()
    };
    let received = backend.broadcast_bytes(payload, root)?;
    Ok(serde_json::from_slice(&received)?)
}

/// Overwrites every parameter in place with `root`'s value.
///
/// Parameters are broadcast in name order, so callers on different ranks may list them in any
/// order as long as the names agree.
pub fn broadcast_parameters<T, B>(
    backend: &B,
    named_parameters: &[(String, Parameter<T>)],
    root: usize,
) -> Result<()>
where
    T: TensorElem,
    B: CollectiveBackend,
{
    let mut ordered: Vec<&(String, Parameter<T>)> = named_parameters.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    debug!(
        rank = backend.rank(),
        root,
        params = ordered.len(),
        "broadcast parameters"
    );
    for (_, param) in ordered {
        let synced = backend.broadcast(&param.value(), root)?;
        param.set_value(&synced)?;
    }
    Ok(())
}

/// Replaces `optimizer`'s state (learning rates, buffers, step count) with `root`'s.
pub fn broadcast_optimizer_state<T, B>(
    backend: &B,
    optimizer: &mut dyn Optimizer<T>,
    root: usize,
) -> Result<()>
where
    T: TensorElem,
    B: CollectiveBackend,
{
    let state = optimizer.state_dict();
    let synced = broadcast_object(backend, &state, root)?;
    if backend.rank() != root {
        optimizer.load_state_dict(&synced)?;
    }
    debug!(rank = backend.rank(), root, "broadcast optimizer state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::run_local_world;
    use crate::optim::{AdamW, Sgd};
    use crate::tensor::Tensor;
    use std::collections::BTreeMap;

    #[test]
    fn test_broadcast_object() {
        let results = run_local_world(3, 3, |backend| {
            backend.init().unwrap();
            let mut local = BTreeMap::new();
            local.insert("rank".to_string(), backend.rank());
            broadcast_object(&backend, &local, 2).unwrap()
        })
        .unwrap();
        for map in results {
            assert_eq!(map.get("rank"), Some(&2));
        }
    }

    #[test]
    fn test_broadcast_parameters_in_any_order() {
        let results = run_local_world(3, 3, |backend| {
            backend.init().unwrap();
            let r = backend.rank() as f32;
            let w = Parameter::new(Tensor::full(&[2], r));
            let b = Parameter::new(Tensor::full(&[1], r + 10.0));
            let mut named = vec![("w".to_string(), w.clone()), ("b".to_string(), b.clone())];
            if backend.rank() == 1 {
                named.reverse();
            }
            broadcast_parameters(&backend, &named, 0).unwrap();
            (w.value().data().to_vec(), b.value().data().to_vec())
        })
        .unwrap();
        for (w, b) in results {
            assert_eq!(w, vec![0.0, 0.0]);
            assert_eq!(b, vec![10.0]);
        }
    }

    #[test]
    fn test_broadcast_optimizer_state() {
        let results = run_local_world(2, 2, |backend| {
            backend.init().unwrap();
            let p = Parameter::new(Tensor::<f64>::ones(&[2]));
            let mut adam = AdamW::new(vec![p.clone()], 0.1 * (backend.rank() + 1) as f64);
            if backend.rank() == 0 {
                p.accumulate_grad(&Tensor::ones(&[2])).unwrap();
                adam.step().unwrap();
            }
            broadcast_optimizer_state(&backend, &mut adam, 0).unwrap();
            adam.state_dict()
        })
        .unwrap();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1].steps, 1);
        assert_eq!(results[1].groups[0].lr, 0.1);
    }

    #[test]
    fn test_broadcast_state_group_mismatch() {
        let results = run_local_world(2, 2, |backend| {
            backend.init().unwrap();
            let mut sgd = if backend.rank() == 0 {
                Sgd::<f32>::new(vec![], 0.1)
            } else {
                Sgd::with_groups(vec![])
            };
            broadcast_optimizer_state(&backend, &mut sgd, 0).is_ok()
        })
        .unwrap();
        assert_eq!(results, vec![true, false]);
    }
}
