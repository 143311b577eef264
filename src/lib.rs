//! Adaptive transition kernels for Metropolis-Hastings samplers.
//!
//! A kernel moves a parameter vector in place and returns the log Hastings
//! correction of the move, or reports that the candidate was rejected
//! outright. The crate provides a single coordinate random walk with
//! reflecting or absorbing bounds, a Haario style adaptive multivariate
//! normal kernel and a composite that applies several kernels at once.
//! Step sizes are tuned toward a target acceptance rate by the driver.
//!
//! ```
//! use adaptmc::{
//!     AdaptiveMvnKernel, AdaptiveMvnSettings, Kernel, ParameterVector, Proposal,
//! };
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut theta = ParameterVector::new("theta", vec![0.; 3]);
//! let mut kernel = AdaptiveMvnKernel::new(&theta, AdaptiveMvnSettings::default())?;
//! let mut rng = StdRng::seed_from_u64(42);
//!
//! let proposal = kernel.propose(&mut theta, &mut rng)?;
//! assert_eq!(proposal, Proposal::Proposed(0.));
//! # Ok::<(), adaptmc::KernelError>(())
//! ```

pub(crate) mod adaptive_mvn;
pub(crate) mod bounds;
pub(crate) mod chain;
pub(crate) mod coercion;
pub(crate) mod composite;
pub(crate) mod kernel;
pub(crate) mod math;
pub(crate) mod parameter;
pub(crate) mod random_walk;
pub(crate) mod transform;

pub use adaptive_mvn::{AdaptationState, AdaptiveMvnKernel, AdaptiveMvnSettings, BaseCovariance};
pub use bounds::Bounds;
pub use chain::{
    sample_parallel, ChainResult, ChainSettings, Draws, MetropolisChain, OperatorSchedule,
    StepInfo, Target,
};
pub use coercion::{
    acceptance_probability, coerce, optimized_scale, performance_suggestion, AcceptanceTracker,
    CoercionSettings, OptimizationSchedule,
};
pub use composite::{AnyKernel, CompositeKernel, CompositeSettings};
pub use kernel::{
    AcceptanceLevels, CoercionMode, Kernel, KernelError, Proposal, Result, Tunable,
    DEFAULT_TARGET_ACCEPTANCE,
};
pub use parameter::{Parameter, ParameterVector};
pub use random_walk::{BoundaryCondition, RandomWalkKernel, RandomWalkSettings};
pub use transform::{Segment, Transform, TransformLayout};
