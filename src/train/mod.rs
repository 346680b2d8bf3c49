//! Training: options, gradient assembly, the optimizer, and the driver.

mod lbfgs;
pub(crate) mod objective;
mod trainer;

pub use self::lbfgs::{Lbfgs, LbfgsParams, Outcome};
pub use self::trainer::{FitOutcome, Trained, Trainer};

/// Regularized estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimation {
    /// Orthant-wise L-BFGS with an L1 penalty
    LbfgsL1,
    /// L-BFGS with a Gaussian (L2) prior
    LbfgsL2,
}

/// Training options shared by all model kinds.
#[derive(Debug, Clone)]
pub struct TrainOpts {
    pub estimation: Estimation,
    /// L1 penalty strength
    pub l1_c: f64,
    /// Gaussian prior standard deviation
    pub l2_sigma: f64,
    /// Maximum optimizer evaluations
    pub max_iter: usize,
    /// Gradient-norm convergence threshold
    pub epsilon: f64,
    /// Relative objective-decrease convergence threshold
    pub delta: f64,
    /// Run a pseudo-likelihood warm start before the main loop
    pub pl_init: bool,
    /// Warm-start evaluation cap
    pub pl_iter: usize,
    /// Restrict the warm start to observation weights
    pub pl_observation_only: bool,
    /// Tie transition bigrams with gold counts below this threshold to one
    /// shared tail parameter
    pub tie_threshold: Option<f64>,
    /// Abort an evaluation when more than this fraction of examples is
    /// skipped for numerical underflow
    pub max_skip_ratio: f64,
}

impl Default for TrainOpts {
    fn default() -> Self {
        Self {
            estimation: Estimation::LbfgsL2,
            l1_c: 1.0,
            l2_sigma: 20.0,
            max_iter: 100,
            epsilon: 1e-5,
            delta: 1e-5,
            pl_init: false,
            pl_iter: 30,
            pl_observation_only: false,
            tie_threshold: None,
            max_skip_ratio: 0.01,
        }
    }
}
