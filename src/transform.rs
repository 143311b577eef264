use serde::{Deserialize, Serialize};

use crate::kernel::{KernelError, Result};

/// Invertible map from a model coordinate `x` to a working coordinate `y`.
///
/// `log_jacobian(x)` is `ln |dy/dx|`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    None,
    Log,
    Logit,
    FisherZ,
    Negate,
    /// Swaps the forward and backward directions of the inner transform.
    Inverse(Box<Transform>),
    /// `outer(inner(x))`.
    Compose(Box<Transform>, Box<Transform>),
}

impl Transform {
    pub fn forward(&self, x: f64) -> f64 {
        match self {
            Transform::None => x,
            Transform::Log => x.ln(),
            Transform::Logit => (x / (1. - x)).ln(),
            Transform::FisherZ => 0.5 * ((1. + x).ln() - (1. - x).ln()),
            Transform::Negate => -x,
            Transform::Inverse(inner) => inner.backward(x),
            Transform::Compose(outer, inner) => outer.forward(inner.forward(x)),
        }
    }

    pub fn backward(&self, y: f64) -> f64 {
        match self {
            Transform::None => y,
            Transform::Log => y.exp(),
            Transform::Logit => 1. / (1. + (-y).exp()),
            Transform::FisherZ => y.tanh(),
            Transform::Negate => -y,
            Transform::Inverse(inner) => inner.forward(y),
            Transform::Compose(outer, inner) => inner.backward(outer.backward(y)),
        }
    }

    pub fn log_jacobian(&self, x: f64) -> f64 {
        match self {
            Transform::None | Transform::Negate => 0.,
            Transform::Log => -x.ln(),
            Transform::Logit => -(1. - x).ln() - x.ln(),
            Transform::FisherZ => -(1. - x).ln() - (1. + x).ln(),
            Transform::Inverse(inner) => -inner.log_jacobian(inner.backward(x)),
            Transform::Compose(outer, inner) => {
                inner.log_jacobian(x) + outer.log_jacobian(inner.forward(x))
            }
        }
    }

    pub fn name(&self) -> String {
        match self {
            Transform::None => "none".to_string(),
            Transform::Log => "log".to_string(),
            Transform::Logit => "logit".to_string(),
            Transform::FisherZ => "fisherZ".to_string(),
            Transform::Negate => "negate".to_string(),
            Transform::Inverse(inner) => format!("inverse.{}", inner.name()),
            Transform::Compose(outer, inner) => {
                format!("compose.{}.{}", outer.name(), inner.name())
            }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::None)
    }

    /// Whether the map reverses the order of values.
    pub(crate) fn is_decreasing(&self) -> bool {
        match self {
            Transform::Negate => true,
            Transform::Inverse(inner) => inner.is_decreasing(),
            Transform::Compose(outer, inner) => outer.is_decreasing() != inner.is_decreasing(),
            _ => false,
        }
    }
}

/// A run of consecutive coordinates that share one transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    /// The same univariate transform applied to each of `len` coordinates.
    Univariate { transform: Transform, len: usize },
    /// Log transform on a block whose values always sum to `sum`.
    ///
    /// The backward map rescales the exponentiated block to that sum.
    LogConstrainedSum { len: usize, sum: f64 },
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Univariate { len, .. } => *len,
            Segment::LogConstrainedSum { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transforms for every coordinate of a parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformLayout {
    segments: Vec<Segment>,
    dim: usize,
}

impl TransformLayout {
    pub fn identity(dim: usize) -> Self {
        Self {
            segments: vec![Segment::Univariate {
                transform: Transform::None,
                len: dim,
            }],
            dim,
        }
    }

    pub fn per_dimension(transforms: Vec<Transform>) -> Self {
        let dim = transforms.len();
        let segments = transforms
            .into_iter()
            .map(|transform| Segment::Univariate { transform, len: 1 })
            .collect();
        Self { segments, dim }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Result<Self> {
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(KernelError::InvalidTransformSegment);
        }
        let dim = segments.iter().map(|segment| segment.len()).sum();
        Ok(Self { segments, dim })
    }

    /// A block of `len` coordinates constrained to sum to `len`.
    pub fn log_constrained_sum(len: usize) -> Result<Self> {
        Self::from_segments(vec![Segment::LogConstrainedSum {
            len,
            sum: len as f64,
        }])
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_identity(&self) -> bool {
        self.segments.iter().all(|segment| {
            matches!(
                segment,
                Segment::Univariate {
                    transform: Transform::None,
                    ..
                }
            )
        })
    }

    /// The univariate transform of coordinate `index`, if it has one.
    pub fn transform_at(&self, index: usize) -> Option<&Transform> {
        let mut start = 0;
        for segment in self.segments.iter() {
            let end = start + segment.len();
            if index < end {
                return match segment {
                    Segment::Univariate { transform, .. } => Some(transform),
                    Segment::LogConstrainedSum { .. } => None,
                };
            }
            start = end;
        }
        None
    }

    pub fn forward(&self, x: &[f64], y: &mut [f64]) {
        assert!(x.len() == self.dim);
        assert!(y.len() == self.dim);
        let mut start = 0;
        for segment in self.segments.iter() {
            let end = start + segment.len();
            match segment {
                Segment::Univariate { transform, .. } => {
                    y[start..end]
                        .iter_mut()
                        .zip(x[start..end].iter())
                        .for_each(|(y, &x)| *y = transform.forward(x));
                }
                Segment::LogConstrainedSum { .. } => {
                    y[start..end]
                        .iter_mut()
                        .zip(x[start..end].iter())
                        .for_each(|(y, &x)| *y = x.ln());
                }
            }
            start = end;
        }
    }

    pub fn backward(&self, y: &[f64], x: &mut [f64]) {
        assert!(x.len() == self.dim);
        assert!(y.len() == self.dim);
        let mut start = 0;
        for segment in self.segments.iter() {
            let end = start + segment.len();
            match segment {
                Segment::Univariate { transform, .. } => {
                    x[start..end]
                        .iter_mut()
                        .zip(y[start..end].iter())
                        .for_each(|(x, &y)| *x = transform.backward(y));
                }
                Segment::LogConstrainedSum { sum, .. } => {
                    let block = &mut x[start..end];
                    block
                        .iter_mut()
                        .zip(y[start..end].iter())
                        .for_each(|(x, &y)| *x = y.exp());
                    let total: f64 = block.iter().sum();
                    block.iter_mut().for_each(|x| *x *= sum / total);
                }
            }
            start = end;
        }
    }

    /// Sum of `ln |dy/dx|` over all coordinates.
    pub fn log_jacobian(&self, x: &[f64]) -> f64 {
        assert!(x.len() == self.dim);
        let mut start = 0;
        let mut total = 0.;
        for segment in self.segments.iter() {
            let end = start + segment.len();
            total += match segment {
                Segment::Univariate { transform, .. } => {
                    if transform.is_identity() {
                        0.
                    } else {
                        x[start..end]
                            .iter()
                            .map(|&x| transform.log_jacobian(x))
                            .sum()
                    }
                }
                Segment::LogConstrainedSum { .. } => {
                    x[start..end].iter().map(|&x| -x.ln()).sum::<f64>()
                }
            };
            start = end;
        }
        total
    }
}
