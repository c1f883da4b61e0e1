//! Learning rate schedulers.
//!
//! Every GPU keeps its own scheduler instance so that a GPU-local update never reads state
//! owned by another device. All instances are advanced together once per training iteration.

use crate::error::{EmbeddingError, Result};

/// A trait for learning rate schedulers.
pub trait LrScheduler: Send + Sync {
    /// Calculates the learning rate for a given step.
    fn get_lr(&self, step: usize) -> f32;
}

/// A fixed learning rate.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLr(pub f32);

impl LrScheduler for ConstantLr {
    fn get_lr(&self, _step: usize) -> f32 {
        self.0
    }
}

/// Linear warmup, a plateau, then polynomial decay to `end_lr`.
///
/// Step `s < warmup_steps` runs at `base_lr * (s + 1) / warmup_steps`, so the first step already
/// moves the weights. The rate then holds at `base_lr` until `decay_start` and decays as
/// `(base_lr - end_lr) * (1 - progress)^power + end_lr` over `decay_steps`, never below `end_lr`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupPolyDecay {
    pub base_lr: f32,
    pub warmup_steps: usize,
    pub decay_start: usize,
    pub decay_steps: usize,
    pub power: f32,
    pub end_lr: f32,
}

impl WarmupPolyDecay {
    pub fn new(base_lr: f32, warmup_steps: usize, decay_start: usize, decay_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            decay_start,
            decay_steps,
            power: 2.0,
            end_lr: base_lr / 1000.0,
        }
    }

    pub fn with_power(mut self, power: f32) -> Self {
        self.power = power;
        self
    }

    pub fn with_end_lr(mut self, end_lr: f32) -> Self {
        self.end_lr = end_lr;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.decay_start < self.warmup_steps {
            return Err(EmbeddingError::wrong_input(format!(
                "decay_start({}) must not precede the end of warmup({})",
                self.decay_start, self.warmup_steps
            )));
        }
        if self.decay_steps == 0 {
            return Err(EmbeddingError::wrong_input("decay_steps must be positive"));
        }
        if !(self.end_lr > 0.0) || self.end_lr > self.base_lr {
            return Err(EmbeddingError::wrong_input(format!(
                "learning rates must satisfy 0 < end_lr({}) <= base_lr({})",
                self.end_lr, self.base_lr
            )));
        }
        Ok(())
    }
}

impl LrScheduler for WarmupPolyDecay {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            self.base_lr * ((step + 1) as f32 / self.warmup_steps as f32)
        } else if step < self.decay_start {
            self.base_lr
        } else if step < self.decay_start + self.decay_steps {
            let progress = (step - self.decay_start) as f32 / self.decay_steps as f32;
            (self.base_lr - self.end_lr) * (1.0 - progress).powf(self.power) + self.end_lr
        } else {
            self.end_lr
        }
    }
}

/// One scheduler per local GPU, advanced in lockstep.
pub struct GpuLearningRateSchedulers {
    schedulers: Vec<Box<dyn LrScheduler>>,
    step: usize,
}

impl GpuLearningRateSchedulers {
    /// Builds `num_gpus` schedulers from `make`.
    pub fn new<S, F>(num_gpus: usize, make: F) -> Self
    where
        S: LrScheduler + 'static,
        F: Fn(usize) -> S,
    {
        Self {
            schedulers: (0..num_gpus)
                .map(|gpu| Box::new(make(gpu)) as Box<dyn LrScheduler>)
                .collect(),
            step: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Learning rate GPU `gpu` uses for the current step.
    ///
    /// A scheduler that yields a rate that is not a positive finite number is an error.
    pub fn lr(&self, gpu: usize) -> Result<f32> {
        let scheduler = self.schedulers.get(gpu).ok_or_else(|| {
            EmbeddingError::IllegalCall(format!(
                "no learning rate scheduler for GPU {gpu} of {}",
                self.schedulers.len()
            ))
        })?;
        let lr = scheduler.get_lr(self.step);
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(EmbeddingError::UnspecificError(format!(
                "learning rate scheduler of GPU {gpu} yields {lr} at step {}",
                self.step
            )));
        }
        Ok(lr)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_poly_decay() {
        let scheduler = WarmupPolyDecay::new(1.0, 10, 20, 10)
            .with_power(1.0)
            .with_end_lr(0.1);

        // Warmup
        assert!((scheduler.get_lr(0) - 0.1).abs() < 1e-6);
        assert!((scheduler.get_lr(4) - 0.5).abs() < 1e-6);
        assert_eq!(scheduler.get_lr(9), 1.0);

        // Plateau
        assert_eq!(scheduler.get_lr(10), 1.0);
        assert_eq!(scheduler.get_lr(19), 1.0);

        // Decay: 0.9 * 0.5 + 0.1 with power 1
        assert!((scheduler.get_lr(25) - 0.55).abs() < 1e-6);

        // End
        assert_eq!(scheduler.get_lr(30), 0.1);
        assert_eq!(scheduler.get_lr(100), 0.1);
        assert!(scheduler.validate().is_ok());
    }

    #[test]
    fn test_poly_power_and_end_lr() {
        let scheduler = WarmupPolyDecay::new(1.0, 0, 0, 10)
            .with_power(2.0)
            .with_end_lr(0.1);
        // (1 - 0.1) * 0.5^2 + 0.1
        assert!((scheduler.get_lr(5) - 0.325).abs() < 1e-6);
        assert!(scheduler.validate().is_ok());
        assert!(WarmupPolyDecay::new(1.0, 10, 5, 10).validate().is_err());
        assert!(WarmupPolyDecay::new(1.0, 0, 0, 10).validate().is_ok());
        assert!(WarmupPolyDecay::new(1.0, 0, 0, 10)
            .with_end_lr(0.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_gpu_schedulers_lockstep() {
        let mut s = GpuLearningRateSchedulers::new(2, |_| WarmupPolyDecay::new(1.0, 4, 4, 4));
        assert_eq!(s.lr(0).unwrap(), 0.25);
        s.advance();
        assert_eq!(s.lr(0).unwrap(), 0.5);
        assert_eq!(s.lr(1).unwrap(), 0.5);
        assert!(s.lr(2).is_err());
    }

    #[test]
    fn test_non_positive_rate_is_rejected() {
        let s = GpuLearningRateSchedulers::new(1, |_| ConstantLr(0.0));
        let err = s.lr(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnspecificError);
        let s = GpuLearningRateSchedulers::new(1, |_| ConstantLr(f32::NAN));
        assert!(s.lr(0).is_err());
    }

    #[test]
    fn test_constant() {
        let s = GpuLearningRateSchedulers::new(3, |_| ConstantLr(0.25));
        assert_eq!(s.len(), 3);
        assert_eq!(s.lr(2).unwrap(), 0.25);
    }
}
