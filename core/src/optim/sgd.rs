use super::{group_states, load_group_lrs, lr_as, Optimizer, OptimizerState, ParamGroup};
use crate::error::Result;
use crate::nn::Parameter;
use crate::tensor::{Tensor, TensorElem};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Stochastic Gradient Descent (SGD) optimizer with optional momentum.
///
/// Updates parameters using the rule:
/// `buf = momentum * buf + grad`, `param = param - lr * buf`
/// (with `momentum = 0` this is plain `param = param - lr * grad`).
pub struct Sgd<T: TensorElem> {
    groups: Vec<ParamGroup<T>>,
    pub momentum: f64,
    momentum_buffers: BTreeMap<(usize, usize), Tensor<T>>,
    steps: u64,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(params: Vec<Parameter<T>>, lr: f64) -> Self {
        Self::with_groups(vec![ParamGroup::new(params, lr)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<T>>) -> Self {
        Self {
            groups,
            momentum: 0.0,
            momentum_buffers: BTreeMap::new(),
            steps: 0,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn param_groups(&self) -> &[ParamGroup<T>] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup<T>] {
        &mut self.groups
    }

    fn step(&mut self) -> Result<()> {
        let momentum = lr_as::<T>(self.momentum)?;
        let use_momentum = self.momentum != 0.0;

        for (g, group) in self.groups.iter().enumerate() {
            let lr = lr_as::<T>(group.lr)?;
            for (i, param) in group.params.iter().enumerate() {
                let buffers = &mut self.momentum_buffers;
                param.update(|value, grad| -> Result<()> {
                    let Some(grad) = grad else {
                        return Ok(());
                    };
                    value.check_same_shape(grad)?;

                    let direction = if use_momentum {
                        let buf = buffers
                            .entry((g, i))
                            .or_insert_with(|| grad.zeros_like());
                        buf.check_same_shape(grad)?;
                        buf.data_mut()
                            .par_iter_mut()
                            .zip(grad.data().par_iter())
                            .for_each(|(b, g)| *b = momentum * *b + *g);
                        buf.data()
                    } else {
                        grad.data()
                    };

                    value
                        .data_mut()
                        .par_iter_mut()
                        .zip(direction.par_iter())
                        .for_each(|(p, d)| *p = *p - lr * *d);
                    Ok(())
                })?;
            }
        }

        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self) -> OptimizerState<T> {
        OptimizerState {
            groups: group_states(&self.groups),
            buffers: self
                .momentum_buffers
                .iter()
                .map(|((g, i), buf)| {
                    (OptimizerState::<T>::buffer_key(*g, *i, "momentum"), buf.clone())
                })
                .collect(),
            steps: self.steps,
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState<T>) -> Result<()> {
        load_group_lrs(&mut self.groups, state)?;

        let mut buffers = BTreeMap::new();
        for (key, buf) in &state.buffers {
            let (g, i) = parse_position(key, "momentum")?;
            buffers.insert((g, i), buf.clone());
        }
        self.momentum_buffers = buffers;
        self.steps = state.steps;
        Ok(())
    }
}

/// Parses a `"{group}.{index}.{buffer}"` key.
pub(crate) fn parse_position(key: &str, expected: &str) -> Result<(usize, usize)> {
    let mut parts = key.splitn(3, '.');
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(g), Some(i), Some(name)) if name == expected => {
            g.parse().ok().zip(i.parse().ok())
        }
        _ => None,
    };
    parsed.ok_or_else(|| crate::error::Error::StateMismatch(format!("unexpected buffer `{key}`")))
}

impl<T: TensorElem> std::fmt::Debug for Sgd<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sgd")
            .field("lrs", &self.lrs())
            .field("momentum", &self.momentum)
            .field("steps", &self.steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_new() {
        let p = Parameter::new(Tensor::<f32>::zeros(&[2]));
        let sgd = Sgd::new(vec![p], 0.1);
        assert_eq!(sgd.lrs(), vec![0.1]);
        assert_eq!(sgd.momentum, 0.0);
    }

    #[test]
    fn test_sgd_update() {
        let p = Parameter::new(Tensor::<f64>::new(vec![1.0, 2.0], &[2]).unwrap());
        p.accumulate_grad(&Tensor::new(vec![0.5, -0.5], &[2]).unwrap())
            .unwrap();
        let mut sgd = Sgd::new(vec![p.clone()], 0.1);

        sgd.step().unwrap();

        // [1.0, 2.0] - 0.1 * [0.5, -0.5] = [0.95, 2.05]
        let value = p.value();
        assert!((value.data()[0] - 0.95).abs() < 1e-9);
        assert!((value.data()[1] - 2.05).abs() < 1e-9);
    }

    #[test]
    fn test_sgd_skips_params_without_grad() {
        let p = Parameter::new(Tensor::<f32>::ones(&[2]));
        let mut sgd = Sgd::new(vec![p.clone()], 1.0);
        sgd.step().unwrap();
        assert_eq!(p.value().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_sgd_momentum_state_roundtrip() {
        let p = Parameter::new(Tensor::<f64>::zeros(&[1]));
        p.accumulate_grad(&Tensor::ones(&[1])).unwrap();
        let mut sgd = Sgd::new(vec![p.clone()], 0.1).with_momentum(0.9);
        sgd.step().unwrap();
        sgd.step().unwrap();

        // buf: 1.0 then 1.9; param: -0.1 then -0.29
        assert!((p.value().data()[0] + 0.29).abs() < 1e-9);

        let state = sgd.state_dict();
        assert_eq!(state.steps, 2);
        assert!(state.buffers.contains_key("0.0.momentum"));

        let q = Parameter::new(Tensor::<f64>::zeros(&[1]));
        let mut other = Sgd::new(vec![q], 0.5).with_momentum(0.9);
        other.load_state_dict(&state).unwrap();
        assert_eq!(other.state_dict(), state);
    }

    #[test]
    fn test_load_state_group_mismatch() {
        let p = Parameter::new(Tensor::<f32>::zeros(&[1]));
        let mut sgd = Sgd::new(vec![p], 0.1);
        let state = OptimizerState {
            groups: vec![],
            buffers: BTreeMap::new(),
            steps: 0,
        };
        assert!(sgd.load_state_dict(&state).is_err());
    }
}
