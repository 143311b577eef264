use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bounds::{reflect, Bounds};
use crate::kernel::{check_weight, CoercionMode, Kernel, KernelError, Proposal, Result, Tunable};
use crate::parameter::Parameter;
use crate::transform::Transform;

/// What happens to a candidate that leaves the admissible interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundaryCondition {
    /// Fold the candidate back into the interval.
    #[default]
    Reflecting,
    /// Reject the candidate.
    Absorbing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomWalkSettings {
    pub weight: f64,
    /// Half width of the uniform offset, in working coordinates.
    pub window_size: f64,
    pub boundary: BoundaryCondition,
    /// Coordinates eligible for a move. All of them if `None`.
    pub indices: Option<Vec<usize>>,
    /// Intersected with the bounds of the parameter itself.
    pub bounds: Bounds,
    /// One transform per coordinate. Identity if `None`.
    pub transforms: Option<Vec<Transform>>,
    pub mode: CoercionMode,
}

impl Default for RandomWalkSettings {
    fn default() -> Self {
        Self {
            weight: 1.,
            window_size: 1.,
            boundary: BoundaryCondition::default(),
            indices: None,
            bounds: Bounds::unbounded(),
            transforms: None,
            mode: CoercionMode::default(),
        }
    }
}

/// Moves one coordinate by a uniform offset in `[-w, w]`.
#[derive(Debug, Clone)]
pub struct RandomWalkKernel {
    parameter_name: String,
    weight: f64,
    log_window: f64,
    boundary: BoundaryCondition,
    dim: usize,
    indices: Vec<usize>,
    /// Admissible interval of every coordinate in working coordinates.
    limits: Vec<(f64, f64)>,
    transforms: Vec<Transform>,
    mode: CoercionMode,
}

impl RandomWalkKernel {
    pub fn new<P: Parameter + ?Sized>(parameter: &P, settings: RandomWalkSettings) -> Result<Self> {
        let dim = parameter.dim();
        check_weight(settings.weight)?;
        if !(settings.window_size.is_finite() && settings.window_size > 0.) {
            return Err(KernelError::InvalidWindowSize(settings.window_size));
        }

        let indices = match settings.indices {
            Some(indices) => {
                if indices.is_empty() || indices.iter().any(|&index| index >= dim) {
                    return Err(KernelError::InvalidIndices { dim });
                }
                indices
            }
            None => {
                if dim == 0 {
                    return Err(KernelError::InvalidIndices { dim });
                }
                (0..dim).collect()
            }
        };

        let transforms = match settings.transforms {
            Some(transforms) => {
                if transforms.len() != dim {
                    return Err(KernelError::DimensionMismatch {
                        what: "transforms",
                        expected: dim,
                        found: transforms.len(),
                    });
                }
                transforms
            }
            None => vec![Transform::None; dim],
        };

        let mut limits = vec![(f64::NEG_INFINITY, f64::INFINITY); dim];
        for &index in indices.iter() {
            let bounds = parameter.bounds(index).intersect(&settings.bounds)?;
            limits[index] = working_bounds(&transforms[index], &bounds);
        }

        Ok(Self {
            parameter_name: parameter.name().to_string(),
            weight: settings.weight,
            log_window: settings.window_size.ln(),
            boundary: settings.boundary,
            dim,
            indices,
            limits,
            transforms,
            mode: settings.mode,
        })
    }

    pub fn window_size(&self) -> f64 {
        self.log_window.exp()
    }

    pub fn boundary(&self) -> BoundaryCondition {
        self.boundary
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Move coordinate `index` by `draw` in working coordinates.
    ///
    /// This is the deterministic half of `propose`, with the random
    /// choices already made.
    pub fn apply<P: Parameter + ?Sized>(
        &self,
        state: &mut P,
        index: usize,
        draw: f64,
    ) -> Result<Proposal> {
        if state.dim() != self.dim {
            return Err(KernelError::DimensionMismatch {
                what: "parameter",
                expected: self.dim,
                found: state.dim(),
            });
        }
        if index >= self.dim {
            return Err(KernelError::InvalidIndices { dim: self.dim });
        }
        let transform = &self.transforms[index];
        let (lower, upper) = self.limits[index];

        let old = state.value(index);
        let mut candidate = transform.forward(old) + draw;

        match self.boundary {
            BoundaryCondition::Reflecting => {
                candidate = reflect(candidate, lower, upper);
            }
            BoundaryCondition::Absorbing => {
                if candidate < lower || candidate > upper {
                    return Ok(Proposal::Rejected);
                }
            }
        }

        let new = transform.backward(candidate);
        state.set_value(index, new);

        if transform.is_identity() {
            return Ok(Proposal::Proposed(0.));
        }
        Ok(Proposal::Proposed(
            transform.log_jacobian(old) - transform.log_jacobian(new),
        ))
    }
}

/// Bounds of a coordinate expressed in working coordinates.
fn working_bounds(transform: &Transform, bounds: &Bounds) -> (f64, f64) {
    if transform.is_identity() {
        return (bounds.lower(), bounds.upper());
    }
    let mut lower = transform.forward(bounds.lower());
    let mut upper = transform.forward(bounds.upper());
    if transform.is_decreasing() {
        std::mem::swap(&mut lower, &mut upper);
    }
    // Limits outside the domain of the transform do not constrain anything.
    if lower.is_nan() {
        lower = f64::NEG_INFINITY;
    }
    if upper.is_nan() {
        upper = f64::INFINITY;
    }
    (lower, upper)
}

impl Kernel for RandomWalkKernel {
    fn propose<P, R>(&mut self, state: &mut P, rng: &mut R) -> Result<Proposal>
    where
        P: Parameter + ?Sized,
        R: Rng + ?Sized,
    {
        let index = self.indices[rng.random_range(0..self.indices.len())];
        let draw = (2. * rng.random::<f64>() - 1.) * self.window_size();
        self.apply(state, index, draw)
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn name(&self) -> String {
        format!("randomWalk({})", self.parameter_name)
    }
}

impl Tunable for RandomWalkKernel {
    fn log_scale(&self) -> f64 {
        self.log_window
    }

    fn set_log_scale(&mut self, value: f64) {
        self.log_window = value;
    }

    fn scale_name(&self) -> &'static str {
        "windowSize"
    }

    fn mode(&self) -> CoercionMode {
        self.mode
    }
}
