//! Learning Rate Schedulers.
//!
//! A scheduler produces the learning rate of every param group for the next step. Most
//! schedules are **anchored** on base learning rates (the rates the optimizer started with) and
//! expose them through [`LrScheduler::base_lrs_mut`] so a strategy can rescale them together
//! with the optimizer. Schedules that only react to the current rates (like
//! [`ReduceLrOnPlateau`]) decline by returning `None`.

use std::f64::consts::PI;

/// A trait for learning rate schedulers.
pub trait LrScheduler: Send {
    /// Base learning rates the schedule is computed from, one per param group.
    ///
    /// `None` means the schedule is not anchored on base rates.
    fn base_lrs(&self) -> Option<&[f64]>;

    /// Mutable access to the base learning rates, `None` if the schedule has none.
    fn base_lrs_mut(&mut self) -> Option<&mut [f64]>;

    /// Advances the schedule by one step and returns the new per-group learning rates.
    ///
    /// # Arguments
    ///
    /// * `current` - The optimizer's current per-group learning rates.
    /// * `metric` - Monitored value, used by metric-driven schedules.
    fn step(&mut self, current: &[f64], metric: Option<f64>) -> Vec<f64>;
}

/// Linear Warmup with Linear Decay.
///
/// Scales each base rate from 0 up to 1× over `warmup_steps`, then linearly down to `min_lr`
/// over the remaining `total_steps - warmup_steps`.
pub struct LinearWarmup {
    pub base_lrs: Vec<f64>,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    last_step: usize,
}

impl LinearWarmup {
    pub fn new(base_lrs: Vec<f64>, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lrs,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
            last_step: 0,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Learning rate of a group with base rate `base` at `step`.
    pub fn lr_at(&self, base: f64, step: usize) -> f64 {
        if step < self.warmup_steps {
            base * (step as f64 / self.warmup_steps as f64)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
            base - (base - self.min_lr) * progress
        } else {
            self.min_lr
        }
    }
}

impl LrScheduler for LinearWarmup {
    fn base_lrs(&self) -> Option<&[f64]> {
        Some(&self.base_lrs)
    }

    fn base_lrs_mut(&mut self) -> Option<&mut [f64]> {
        Some(&mut self.base_lrs)
    }

    fn step(&mut self, _current: &[f64], _metric: Option<f64>) -> Vec<f64> {
        self.last_step += 1;
        let step = self.last_step;
        self.base_lrs.iter().map(|b| self.lr_at(*b, step)).collect()
    }
}

/// Cosine Decay with Warmup.
///
/// Scales each base rate from 0 up to 1× over `warmup_steps`, then follows a cosine curve down
/// to `min_lr`.
pub struct CosineDecay {
    pub base_lrs: Vec<f64>,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    last_step: usize,
}

impl CosineDecay {
    pub fn new(base_lrs: Vec<f64>, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lrs,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
            last_step: 0,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn lr_at(&self, base: f64, step: usize) -> f64 {
        if step < self.warmup_steps {
            base * (step as f64 / self.warmup_steps as f64)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
            let cosine_decay = 0.5 * (1.0 + (progress * PI).cos());
            self.min_lr + (base - self.min_lr) * cosine_decay
        } else {
            self.min_lr
        }
    }
}

impl LrScheduler for CosineDecay {
    fn base_lrs(&self) -> Option<&[f64]> {
        Some(&self.base_lrs)
    }

    fn base_lrs_mut(&mut self) -> Option<&mut [f64]> {
        Some(&mut self.base_lrs)
    }

    fn step(&mut self, _current: &[f64], _metric: Option<f64>) -> Vec<f64> {
        self.last_step += 1;
        let step = self.last_step;
        self.base_lrs.iter().map(|b| self.lr_at(*b, step)).collect()
    }
}

/// Multiplies the current rates by `factor` once the monitored metric has not improved
/// (decreased) for more than `patience` steps.
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    best: Option<f64>,
    bad_steps: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            min_lr: 0.0,
            best: None,
            bad_steps: 0,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn base_lrs(&self) -> Option<&[f64]> {
        None
    }

    fn base_lrs_mut(&mut self) -> Option<&mut [f64]> {
        None
    }

    fn step(&mut self, current: &[f64], metric: Option<f64>) -> Vec<f64> {
        let Some(metric) = metric else {
            return current.to_vec();
        };

        match self.best {
            Some(best) if metric >= best => self.bad_steps += 1,
            _ => {
                self.best = Some(metric);
                self.bad_steps = 0;
            }
        }

        if self.bad_steps > self.patience {
            self.bad_steps = 0;
            current
                .iter()
                .map(|lr| (lr * self.factor).max(self.min_lr))
                .collect()
        } else {
            current.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_warmup() {
        let scheduler = LinearWarmup::new(vec![1.0], 10, 20);

        assert_eq!(scheduler.lr_at(1.0, 0), 0.0);
        assert_eq!(scheduler.lr_at(1.0, 5), 0.5);
        assert_eq!(scheduler.lr_at(1.0, 10), 1.0);
        assert_eq!(scheduler.lr_at(1.0, 15), 0.5);
        assert_eq!(scheduler.lr_at(1.0, 20), 0.0);
        assert_eq!(scheduler.lr_at(1.0, 100), 0.0);
    }

    #[test]
    fn test_linear_warmup_steps_from_base() {
        let mut scheduler = LinearWarmup::new(vec![0.4, 0.8], 4, 8);
        assert_eq!(scheduler.step(&[0.0, 0.0], None), vec![0.1, 0.2]);
        assert_eq!(scheduler.step(&[0.1, 0.2], None), vec![0.2, 0.4]);
    }

    #[test]
    fn test_cosine_decay() {
        let scheduler = CosineDecay::new(vec![1.0], 10, 20);

        assert_eq!(scheduler.lr_at(1.0, 0), 0.0);
        assert_eq!(scheduler.lr_at(1.0, 5), 0.5);
        assert_eq!(scheduler.lr_at(1.0, 10), 1.0);
        assert!((scheduler.lr_at(1.0, 15) - 0.5).abs() < 1e-9);
        assert_eq!(scheduler.lr_at(1.0, 20), 0.0);
    }

    #[test]
    fn test_base_lrs_capability() {
        let mut anchored = CosineDecay::new(vec![0.1], 0, 10);
        if let Some(base) = anchored.base_lrs_mut() {
            base.iter_mut().for_each(|b| *b *= 4.0);
        }
        assert_eq!(anchored.base_lrs(), Some(&[0.4][..]));

        let mut plateau = ReduceLrOnPlateau::new(0.5, 0);
        assert!(plateau.base_lrs().is_none());
        assert!(plateau.base_lrs_mut().is_none());
    }

    #[test]
    fn test_reduce_on_plateau() {
        let mut scheduler = ReduceLrOnPlateau::new(0.5, 1).with_min_lr(0.05);

        assert_eq!(scheduler.step(&[0.4], Some(1.0)), vec![0.4]);
        assert_eq!(scheduler.step(&[0.4], Some(0.9)), vec![0.4]);
        assert_eq!(scheduler.step(&[0.4], Some(0.95)), vec![0.4]);
        assert_eq!(scheduler.step(&[0.4], Some(0.95)), vec![0.2]);
        assert_eq!(scheduler.step(&[0.08], Some(2.0)), vec![0.08]);
        assert_eq!(scheduler.step(&[0.08], Some(2.0)), vec![0.05]);

        assert_eq!(scheduler.step(&[0.3], None), vec![0.3]);
    }
}
