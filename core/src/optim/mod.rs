//! Optimizer update engine for embedding rows.
//!
//! The update rules in [`rules`] are pure functions of
//! `(row, accumulated gradient, hyperparameters, row state)`. The [`OptimizerEngine`] applies
//! them to the rows touched in a step and owns the step counter.

pub mod engine;
pub mod rules;
pub mod scheduler;

pub use engine::{OptimizerEngine, RowParts, UpdateTarget};
pub use rules::{apply_update, init_state, state_len};
pub use scheduler::{ConstantLr, GpuLearningRateSchedulers, LrScheduler, WarmupPolyDecay};

use crate::error::{EmbeddingError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerType {
    Sgd,
    MomentumSgd,
    Nesterov,
    AdaGrad,
    Adam,
    Ftrl,
}

impl OptimizerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerType::Sgd => "SGD",
            OptimizerType::MomentumSgd => "MomentumSGD",
            OptimizerType::Nesterov => "Nesterov",
            OptimizerType::AdaGrad => "AdaGrad",
            OptimizerType::Adam => "Adam",
            OptimizerType::Ftrl => "Ftrl",
        }
    }
}

impl FromStr for OptimizerType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SGD" => Ok(OptimizerType::Sgd),
            "MomentumSGD" => Ok(OptimizerType::MomentumSgd),
            "Nesterov" => Ok(OptimizerType::Nesterov),
            "AdaGrad" => Ok(OptimizerType::AdaGrad),
            "Adam" => Ok(OptimizerType::Adam),
            "Ftrl" => Ok(OptimizerType::Ftrl),
            other => Err(EmbeddingError::wrong_input(format!(
                "No such optimizer: {other}"
            ))),
        }
    }
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rows an update step touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    /// Only rows that received a gradient this step.
    Local,
    /// Every stored row; rows without a gradient see a zero gradient.
    Global,
    /// Like `Global`, but the zero-gradient steps of an untouched row are replayed lazily the
    /// next time the row receives a gradient.
    LazyGlobal,
}

impl FromStr for UpdateType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Local" => Ok(UpdateType::Local),
            "Global" => Ok(UpdateType::Global),
            "LazyGlobal" => Ok(UpdateType::LazyGlobal),
            other => Err(EmbeddingError::wrong_input(format!(
                "No such update type: {other}"
            ))),
        }
    }
}

/// Hyperparameters of exactly one optimizer kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptHyperParams {
    /// `atomic_update` allows several contributions for one row in a single step; they are
    /// applied one after another. Without it every row must arrive pre-aggregated.
    Sgd { atomic_update: bool },
    MomentumSgd { factor: f32 },
    Nesterov { mu: f32 },
    AdaGrad { initial_accu_value: f32, epsilon: f32 },
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    Ftrl { beta: f32, lambda1: f32, lambda2: f32 },
}

impl OptHyperParams {
    pub fn optimizer_type(&self) -> OptimizerType {
        match self {
            OptHyperParams::Sgd { .. } => OptimizerType::Sgd,
            OptHyperParams::MomentumSgd { .. } => OptimizerType::MomentumSgd,
            OptHyperParams::Nesterov { .. } => OptimizerType::Nesterov,
            OptHyperParams::AdaGrad { .. } => OptimizerType::AdaGrad,
            OptHyperParams::Adam { .. } => OptimizerType::Adam,
            OptHyperParams::Ftrl { .. } => OptimizerType::Ftrl,
        }
    }

    /// Number of per-element state vectors the rule keeps for every row.
    pub fn state_slots(&self) -> usize {
        match self {
            OptHyperParams::Sgd { .. } => 0,
            OptHyperParams::MomentumSgd { .. }
            | OptHyperParams::Nesterov { .. }
            | OptHyperParams::AdaGrad { .. } => 1,
            OptHyperParams::Adam { .. } | OptHyperParams::Ftrl { .. } => 2,
        }
    }

    /// Whether duplicate rows inside one update are legal.
    pub fn allows_duplicate_rows(&self) -> bool {
        matches!(
            self,
            OptHyperParams::Sgd {
                atomic_update: true
            }
        )
    }

    /// Sensible defaults for every kind.
    pub fn default_for(optimizer_type: OptimizerType) -> Self {
        match optimizer_type {
            OptimizerType::Sgd => OptHyperParams::Sgd {
                atomic_update: true,
            },
            OptimizerType::MomentumSgd => OptHyperParams::MomentumSgd { factor: 0.9 },
            OptimizerType::Nesterov => OptHyperParams::Nesterov { mu: 0.9 },
            OptimizerType::AdaGrad => OptHyperParams::AdaGrad {
                initial_accu_value: 0.0,
                epsilon: 1e-7,
            },
            OptimizerType::Adam => OptHyperParams::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-7,
            },
            OptimizerType::Ftrl => OptHyperParams::Ftrl {
                beta: 0.0,
                lambda1: 0.0,
                lambda2: 0.0,
            },
        }
    }
}

/// Optimizer configuration of one embedding. Immutable once the embedding is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptParams {
    pub hyperparams: OptHyperParams,
    pub learning_rate: f32,
    pub update_type: UpdateType,
    /// Gradients are divided by this before the rule runs.
    pub scaler: f32,
}

impl Default for OptParams {
    fn default() -> Self {
        Self {
            hyperparams: OptHyperParams::default_for(OptimizerType::Adam),
            learning_rate: Self::DEFAULT_LR,
            update_type: UpdateType::Local,
            scaler: 1.0,
        }
    }
}

impl OptParams {
    pub const DEFAULT_LR: f32 = 0.001;

    pub fn new(hyperparams: OptHyperParams, learning_rate: f32) -> Self {
        Self {
            hyperparams,
            learning_rate,
            update_type: UpdateType::Local,
            scaler: 1.0,
        }
    }

    pub fn with_update_type(mut self, update_type: UpdateType) -> Self {
        self.update_type = update_type;
        self
    }

    pub fn with_scaler(mut self, scaler: f32) -> Self {
        self.scaler = scaler;
        self
    }

    /// Builds params from a declared optimizer type and its hyperparameter set, rejecting a
    /// set that belongs to another kind.
    pub fn from_parts(
        optimizer_type: OptimizerType,
        hyperparams: OptHyperParams,
        learning_rate: f32,
        update_type: UpdateType,
    ) -> Result<Self> {
        if hyperparams.optimizer_type() != optimizer_type {
            return Err(EmbeddingError::wrong_input(format!(
                "optimizer type {} does not match hyperparameters of {}",
                optimizer_type,
                hyperparams.optimizer_type()
            )));
        }
        let params = Self::new(hyperparams, learning_rate).with_update_type(update_type);
        params.validate()?;
        Ok(params)
    }

    pub fn optimizer_type(&self) -> OptimizerType {
        self.hyperparams.optimizer_type()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(EmbeddingError::wrong_input(format!(
                "learning rate({}) must be positive",
                self.learning_rate
            )));
        }
        if !(self.scaler.is_finite() && self.scaler > 0.0) {
            return Err(EmbeddingError::wrong_input(format!(
                "gradient scaler({}) must be positive",
                self.scaler
            )));
        }
        let unit = |name: &str, v: f32| -> Result<()> {
            if (0.0..1.0).contains(&v) {
                Ok(())
            } else {
                Err(EmbeddingError::wrong_input(format!(
                    "{name}({v}) must be in [0, 1)"
                )))
            }
        };
        match self.hyperparams {
            OptHyperParams::Sgd { .. } => Ok(()),
            OptHyperParams::MomentumSgd { factor } => unit("momentum_factor", factor),
            OptHyperParams::Nesterov { mu } => unit("momentum_factor", mu),
            OptHyperParams::AdaGrad {
                initial_accu_value,
                epsilon,
            } => {
                if initial_accu_value < 0.0 || epsilon <= 0.0 {
                    return Err(EmbeddingError::wrong_input(
                        "adagrad needs initial_accu_value >= 0 and epsilon > 0",
                    ));
                }
                Ok(())
            }
            OptHyperParams::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                unit("beta1", beta1)?;
                unit("beta2", beta2)?;
                if epsilon <= 0.0 {
                    return Err(EmbeddingError::wrong_input("adam epsilon must be positive"));
                }
                Ok(())
            }
            OptHyperParams::Ftrl {
                beta,
                lambda1,
                lambda2,
            } => {
                if beta < 0.0 || lambda1 < 0.0 || lambda2 < 0.0 {
                    return Err(EmbeddingError::wrong_input(
                        "ftrl beta, lambda1 and lambda2 must be non-negative",
                    ));
                }
                Ok(())
            }
        }
    }
}
