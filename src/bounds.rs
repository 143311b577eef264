use serde::{Deserialize, Serialize};

use crate::kernel::{KernelError, Result};

/// Closed interval `[lower, upper]` of admissible values for one coordinate.
///
/// Either limit may be infinite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    lower: f64,
    upper: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Bounds {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(KernelError::InvalidBounds { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    pub fn positive() -> Self {
        Self {
            lower: 0.,
            upper: f64::INFINITY,
        }
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// The tighter of both intervals.
    pub fn intersect(&self, other: &Bounds) -> Result<Bounds> {
        Bounds::new(self.lower.max(other.lower), self.upper.min(other.upper))
    }

    /// Fold `value` back into the interval as if it bounced off the limits.
    ///
    /// Runs in constant time no matter how many widths `value` lies outside.
    pub fn reflect(&self, value: f64) -> f64 {
        reflect(value, self.lower, self.upper)
    }
}

pub(crate) fn reflect(value: f64, lower: f64, upper: f64) -> f64 {
    if upper == lower {
        return upper;
    }
    if value < lower {
        if upper.is_infinite() {
            return lower + (lower - value);
        }
        let width = upper - lower;
        let excess = lower - value;
        let widths = (excess / width).floor();
        let remainder = excess - width * widths;
        if widths % 2. == 0. {
            lower + remainder
        } else {
            upper - remainder
        }
    } else if value > upper {
        if lower.is_infinite() {
            return upper - (value - upper);
        }
        let width = upper - lower;
        let excess = value - upper;
        let widths = (excess / width).floor();
        let remainder = excess - width * widths;
        if widths % 2. == 0. {
            upper - remainder
        } else {
            lower + remainder
        }
    } else {
        value
    }
}
