use crate::bounds::Bounds;
use crate::kernel::{KernelError, Result};

/// The vector of model values a kernel operates on.
///
/// The driver owns it; kernels only borrow it for the duration of one
/// proposal.
pub trait Parameter {
    fn dim(&self) -> usize;

    fn value(&self, index: usize) -> f64;

    fn set_value(&mut self, index: usize, value: f64);

    fn bounds(&self, index: usize) -> Bounds;

    fn name(&self) -> &str {
        "parameter"
    }

    fn read_values(&self, out: &mut [f64]) {
        assert!(out.len() == self.dim());
        out.iter_mut()
            .enumerate()
            .for_each(|(i, out)| *out = self.value(i));
    }

    fn write_values(&mut self, values: &[f64]) {
        assert!(values.len() == self.dim());
        values
            .iter()
            .enumerate()
            .for_each(|(i, &value)| self.set_value(i, value));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    name: String,
    values: Vec<f64>,
    bounds: Vec<Bounds>,
}

impl ParameterVector {
    /// An unbounded vector.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        let bounds = vec![Bounds::unbounded(); values.len()];
        Self {
            name: name.into(),
            values,
            bounds,
        }
    }

    pub fn with_bounds(
        name: impl Into<String>,
        values: Vec<f64>,
        bounds: Vec<Bounds>,
    ) -> Result<Self> {
        if bounds.len() != values.len() {
            return Err(KernelError::DimensionMismatch {
                what: "bounds",
                expected: values.len(),
                found: bounds.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            values,
            bounds,
        })
    }

    /// Every coordinate shares the same bounds.
    pub fn with_uniform_bounds(name: impl Into<String>, values: Vec<f64>, bounds: Bounds) -> Self {
        let bounds = vec![bounds; values.len()];
        Self {
            name: name.into(),
            values,
            bounds,
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Whether every coordinate lies inside its bounds.
    pub fn in_bounds(&self) -> bool {
        self.values
            .iter()
            .zip(self.bounds.iter())
            .all(|(&value, bounds)| bounds.contains(value))
    }
}

impl Parameter for ParameterVector {
    fn dim(&self) -> usize {
        self.values.len()
    }

    fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    fn set_value(&mut self, index: usize, value: f64) {
        self.values[index] = value;
    }

    fn bounds(&self, index: usize) -> Bounds {
        self.bounds[index]
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_values(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.values);
    }

    fn write_values(&mut self, values: &[f64]) {
        self.values.copy_from_slice(values);
    }
}
