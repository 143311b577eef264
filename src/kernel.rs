use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parameter::Parameter;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("base covariance is not of full rank (rank {rank}, dimension {dim})")]
    RankDeficient { rank: usize, dim: usize },
    #[error("scale factor must be greater than 0, got {0}")]
    InvalidScaleFactor(f64),
    #[error("window size must be greater than 0, got {0}")]
    InvalidWindowSize(f64),
    #[error("beta must lie in [0, 1], got {0}")]
    InvalidBeta(f64),
    #[error("burnin ({burnin}) must not exceed the initial period ({initial})")]
    InvalidBurnin { burnin: u64, initial: u64 },
    #[error("covariance matrix needs to be updated at least every single iteration")]
    InvalidUpdateInterval,
    #[error("kernel weight must be finite and positive, got {0}")]
    InvalidWeight(f64),
    #[error("variance matrix is not square ({rows}x{cols})")]
    NotSquare { rows: usize, cols: usize },
    #[error("{what} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid bounds [{lower}, {upper}]")]
    InvalidBounds { lower: f64, upper: f64 },
    #[error("coordinate subset must be non-empty and within 0..{dim}")]
    InvalidIndices { dim: usize },
    #[error("transform segment of size 0 encountered")]
    InvalidTransformSegment,
    #[error("blended covariance is not positive definite at iteration {iteration}")]
    NotPositiveDefinite { iteration: u64 },
    #[error("no tunable kernel available")]
    NotTunable,
}

impl KernelError {
    /// Fatal errors leave the adaptation state unusable and must end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::NotPositiveDefinite { .. })
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// The outcome of a single proposal.
///
/// A rejection is an ordinary outcome of a move, it is not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// The state now holds the candidate. Carries the log Hastings ratio,
    /// including any Jacobian terms from coordinate transforms.
    Proposed(f64),
    /// The candidate was structurally invalid. Leaf kernels leave the state
    /// unchanged, but a composite may already have moved it, so the driver
    /// must restore its snapshot.
    Rejected,
}

impl Proposal {
    pub fn log_hastings(&self) -> Option<f64> {
        match self {
            Proposal::Proposed(value) => Some(*value),
            Proposal::Rejected => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Proposal::Rejected)
    }
}

/// A transition kernel of a Metropolis-Hastings chain.
pub trait Kernel {
    /// Overwrite `state` with a candidate and return the log Hastings ratio.
    ///
    /// Every random draw is taken from `rng`, in a fixed order, so that a
    /// seeded run is reproducible.
    fn propose<P, R>(&mut self, state: &mut P, rng: &mut R) -> Result<Proposal>
    where
        P: Parameter + ?Sized,
        R: Rng + ?Sized;

    /// Relative frequency with which the driver selects this kernel.
    fn weight(&self) -> f64;

    fn name(&self) -> String;
}

/// When the driver is allowed to adjust the scale of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoercionMode {
    /// Follow the global setting of the driver.
    #[default]
    Default,
    On,
    Off,
}

impl CoercionMode {
    pub fn is_active(&self, global: bool) -> bool {
        match self {
            CoercionMode::On => true,
            CoercionMode::Off => false,
            CoercionMode::Default => global,
        }
    }
}

pub const DEFAULT_TARGET_ACCEPTANCE: f64 = 0.234;

/// Acceptance rates used to judge how well a kernel is tuned.
///
/// These only drive suggestions, they never constrain the chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceLevels {
    pub min_acceptable: f64,
    pub max_acceptable: f64,
    pub min_good: f64,
    pub max_good: f64,
}

impl Default for AcceptanceLevels {
    fn default() -> Self {
        Self {
            min_acceptable: 0.1,
            max_acceptable: 0.4,
            min_good: 0.2,
            max_good: 0.3,
        }
    }
}

impl AcceptanceLevels {
    pub fn is_acceptable(&self, rate: f64) -> bool {
        (self.min_acceptable..=self.max_acceptable).contains(&rate)
    }

    pub fn is_good(&self, rate: f64) -> bool {
        (self.min_good..=self.max_good).contains(&rate)
    }
}

/// A kernel with a positive scalar step size that can be tuned.
///
/// The step size is exposed on the log scale, so that additive updates
/// keep it positive.
pub trait Tunable {
    fn log_scale(&self) -> f64;

    fn set_log_scale(&mut self, value: f64);

    /// The step size itself, not its logarithm.
    fn raw_scale(&self) -> f64 {
        self.log_scale().exp()
    }

    /// Name of the step size, used in tuning suggestions.
    fn scale_name(&self) -> &'static str;

    fn mode(&self) -> CoercionMode {
        CoercionMode::Default
    }

    fn target_acceptance(&self) -> f64 {
        DEFAULT_TARGET_ACCEPTANCE
    }

    fn acceptance_levels(&self) -> AcceptanceLevels {
        AcceptanceLevels::default()
    }
}

pub(crate) fn check_weight(weight: f64) -> Result<()> {
    if weight.is_finite() && weight > 0. {
        Ok(())
    } else {
        Err(KernelError::InvalidWeight(weight))
    }
}
