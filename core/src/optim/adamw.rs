use super::sgd::parse_position;
use super::{group_states, load_group_lrs, lr_as, Optimizer, OptimizerState, ParamGroup};
use crate::error::{Error, Result};
use crate::nn::Parameter;
use crate::tensor::{Tensor, TensorElem};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// The step count $t$ is shared by all parameters; it is part of the state that a strategy
/// broadcasts from rank 0 so resumed runs agree on bias correction.
pub struct AdamW<T: TensorElem> {
    groups: Vec<ParamGroup<T>>,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// First and second moments per `(group, index)`.
    moments: BTreeMap<(usize, usize), (Tensor<T>, Tensor<T>)>,
    steps: u64,
}

impl<T: TensorElem> AdamW<T> {
    /// Creates a new AdamW optimizer over a single group.
    ///
    /// Defaults: `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`, `weight_decay = 0.01`.
    pub fn new(params: Vec<Parameter<T>>, lr: f64) -> Self {
        Self::with_groups(vec![ParamGroup::new(params, lr)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<T>>) -> Self {
        Self {
            groups,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            moments: BTreeMap::new(),
            steps: 0,
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl<T: TensorElem> Optimizer<T> for AdamW<T> {
    fn param_groups(&self) -> &[ParamGroup<T>] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup<T>] {
        &mut self.groups
    }

    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        let step = self.steps as i32;

        let b1 = lr_as::<T>(self.beta1)?;
        let b2 = lr_as::<T>(self.beta2)?;
        let eps = lr_as::<T>(self.epsilon)?;
        let lambda = lr_as::<T>(self.weight_decay)?;
        let one = T::one();

        // Bias correction terms: 1 - beta^t
        let bias_correction1 = lr_as::<T>(1.0 - self.beta1.powi(step))?;
        let bias_correction2 = lr_as::<T>(1.0 - self.beta2.powi(step))?;

        for (g, group) in self.groups.iter().enumerate() {
            let lr = lr_as::<T>(group.lr)?;
            for (i, param) in group.params.iter().enumerate() {
                let moments = &mut self.moments;
                param.update(|value, grad| -> Result<()> {
                    let Some(grad) = grad else {
                        return Ok(());
                    };
                    value.check_same_shape(grad)?;

                    let (m, v) = moments
                        .entry((g, i))
                        .or_insert_with(|| (grad.zeros_like(), grad.zeros_like()));

                    value
                        .data_mut()
                        .par_iter_mut()
                        .zip(grad.data().par_iter())
                        .zip(m.data_mut().par_iter_mut())
                        .zip(v.data_mut().par_iter_mut())
                        .for_each(|(((p, g), m_elem), v_elem)| {
                            *m_elem = b1 * *m_elem + (one - b1) * *g;
                            *v_elem = b2 * *v_elem + (one - b2) * *g * *g;

                            let m_hat = *m_elem / bias_correction1;
                            let v_hat = *v_elem / bias_correction2;

                            let v_sqrt = v_hat.to_f64().map(f64::sqrt).and_then(T::from_f64);
                            let denom = v_sqrt.unwrap_or_else(T::zero) + eps;

                            *p = *p - lr * (m_hat / denom + lambda * *p);
                        });
                    Ok(())
                })?;
            }
        }

        Ok(())
    }

    fn state_dict(&self) -> OptimizerState<T> {
        let mut buffers = BTreeMap::new();
        for ((g, i), (m, v)) in &self.moments {
            buffers.insert(OptimizerState::<T>::buffer_key(*g, *i, "exp_avg"), m.clone());
            buffers.insert(OptimizerState::<T>::buffer_key(*g, *i, "exp_avg_sq"), v.clone());
        }
        OptimizerState {
            groups: group_states(&self.groups),
            buffers,
            steps: self.steps,
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState<T>) -> Result<()> {
        load_group_lrs(&mut self.groups, state)?;

        let mut moments = BTreeMap::new();
        for (key, m) in &state.buffers {
            if !key.ends_with(".exp_avg") {
                continue;
            }
            let position = parse_position(key, "exp_avg")?;
            let v_key = OptimizerState::<T>::buffer_key(position.0, position.1, "exp_avg_sq");
            let v = state
                .buffers
                .get(&v_key)
                .ok_or_else(|| Error::StateMismatch(format!("missing buffer `{v_key}`")))?;
            moments.insert(position, (m.clone(), v.clone()));
        }
        self.moments = moments;
        self.steps = state.steps;
        Ok(())
    }
}

impl<T: TensorElem> std::fmt::Debug for AdamW<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdamW")
            .field("lrs", &self.lrs())
            .field("betas", &(self.beta1, self.beta2))
            .field("weight_decay", &self.weight_decay)
            .field("steps", &self.steps)
            .finish()
    }
}
