use faer::Mat;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::kernel::{check_weight, CoercionMode, Kernel, KernelError, Proposal, Result, Tunable};
use crate::math::{
    cholesky_lower, lower_triangular_mul_add, symmetric_rank, write_row_major, xtx_inverse,
};
use crate::parameter::Parameter;
use crate::transform::TransformLayout;

/// Seed covariance of the adaptive kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BaseCovariance {
    /// `coefficient² / dim` times the identity.
    Scaled { coefficient: f64 },
    /// A variance matrix given by its rows, used as is.
    Variance(Vec<Vec<f64>>),
    /// A design matrix `X` given by its rows. The seed is `(XᵀX)⁻¹`.
    XtXInverse(Vec<Vec<f64>>),
}

impl Default for BaseCovariance {
    fn default() -> Self {
        BaseCovariance::Scaled { coefficient: 1. }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveMvnSettings {
    pub weight: f64,
    /// Initial multiplier of the proposal standard deviation.
    pub scale_factor: f64,
    /// Weight of the base covariance in the blend.
    pub beta: f64,
    /// Number of iterations before the empirical covariance is used.
    /// Raised to `2 * dim` if smaller.
    pub initial: u64,
    /// Number of iterations before statistics accumulate.
    pub burnin: u64,
    /// Update interval of the statistics and the factorization.
    pub every: u64,
    pub base: BaseCovariance,
    pub skip_rank_check: bool,
    /// Transforms to working coordinates. Identity if `None`.
    pub transforms: Option<TransformLayout>,
    pub mode: CoercionMode,
}

impl Default for AdaptiveMvnSettings {
    fn default() -> Self {
        Self {
            weight: 1.,
            scale_factor: 1.,
            beta: 0.05,
            initial: 200,
            burnin: 0,
            every: 1,
            base: BaseCovariance::default(),
            skip_rank_check: false,
            transforms: None,
            mode: CoercionMode::default(),
        }
    }
}

/// Running mean and covariance of the working-coordinate trajectory.
#[derive(Debug, Clone)]
pub struct AdaptationState {
    burnin: u64,
    every: u64,
    iterations: u64,
    updates: u64,
    // After an update `old_mean` holds the latest mean.
    old_mean: Vec<f64>,
    new_mean: Vec<f64>,
    empirical: Mat<f64>,
}

impl AdaptationState {
    fn new(dim: usize, burnin: u64, every: u64) -> Self {
        Self {
            burnin,
            every,
            iterations: 0,
            updates: 0,
            old_mean: vec![0.; dim],
            new_mean: vec![0.; dim],
            empirical: Mat::zeros(dim, dim),
        }
    }

    fn reset(&mut self) {
        self.old_mean.iter_mut().for_each(|val| *val = 0.);
        self.new_mean.iter_mut().for_each(|val| *val = 0.);
        let dim = self.empirical.nrows();
        self.empirical = Mat::zeros(dim, dim);
    }

    /// Count one iteration and fold `working` into the statistics if this
    /// iteration is an update event.
    fn advance(&mut self, working: &[f64]) {
        self.iterations += 1;
        let iterations = self.iterations;

        if iterations == 1 || iterations == self.burnin + 1 {
            self.reset();
            return;
        }
        if iterations <= self.burnin + 1 || iterations % self.every != 0 {
            return;
        }

        self.updates += 1;
        let updates = self.updates as f64;
        self.new_mean
            .iter_mut()
            .zip(self.old_mean.iter())
            .zip(working.iter())
            .for_each(|((new, &old), &x)| *new = (old * (updates - 1.) + x) / updates);

        if self.updates > 1 {
            let dim = working.len();
            for i in 0..dim {
                for j in i..dim {
                    let value = (self.empirical[(i, j)] * (updates - 2.)
                        + working[i] * working[j]
                        + (updates - 1.) * self.old_mean[i] * self.old_mean[j]
                        - updates * self.new_mean[i] * self.new_mean[j])
                        / (updates - 1.);
                    self.empirical[(i, j)] = value;
                    self.empirical[(j, i)] = value;
                }
            }
        }

        std::mem::swap(&mut self.old_mean, &mut self.new_mean);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn running_mean(&self) -> &[f64] {
        &self.old_mean
    }

    pub fn running_cov(&self) -> &Mat<f64> {
        &self.empirical
    }
}

/// Haario style adaptive multivariate normal random walk.
///
/// Proposes `y' = y + L ε` in working coordinates, where `L` is the lower
/// Cholesky factor of a blend of the empirical covariance of the chain and
/// a fixed base covariance, and `ε ~ N(0, s² I)`.
#[derive(Debug, Clone)]
pub struct AdaptiveMvnKernel {
    parameter_name: String,
    dim: usize,
    weight: f64,
    scale_factor: f64,
    beta: f64,
    initial: u64,
    mode: CoercionMode,
    layout: TransformLayout,

    state: AdaptationState,
    base: Mat<f64>,
    base_factor: Mat<f64>,
    blended: Mat<f64>,
    cholesky: Mat<f64>,

    factor_rows: Vec<f64>,
    epsilon: Vec<f64>,
    values: Vec<f64>,
    working: Vec<f64>,
    candidate: Vec<f64>,
}

impl AdaptiveMvnKernel {
    pub fn new<P: Parameter + ?Sized>(
        parameter: &P,
        settings: AdaptiveMvnSettings,
    ) -> Result<Self> {
        let dim = parameter.dim();

        check_weight(settings.weight)?;
        if !(settings.scale_factor.is_finite() && settings.scale_factor > 0.) {
            return Err(KernelError::InvalidScaleFactor(settings.scale_factor));
        }
        if !(0. ..=1.).contains(&settings.beta) {
            return Err(KernelError::InvalidBeta(settings.beta));
        }
        if settings.burnin > settings.initial {
            return Err(KernelError::InvalidBurnin {
                burnin: settings.burnin,
                initial: settings.initial,
            });
        }
        if settings.every == 0 {
            return Err(KernelError::InvalidUpdateInterval);
        }

        let mut initial = settings.initial;
        let min_initial = 2 * dim as u64;
        if initial < min_initial {
            log::info!(
                "raising initial period of {} from {} to {}",
                parameter.name(),
                initial,
                min_initial
            );
            initial = min_initial;
        }

        let layout = match settings.transforms {
            Some(layout) => {
                if layout.dim() != dim {
                    return Err(KernelError::DimensionMismatch {
                        what: "transforms",
                        expected: dim,
                        found: layout.dim(),
                    });
                }
                layout
            }
            None => TransformLayout::identity(dim),
        };

        let base = base_covariance(&settings.base, dim, settings.skip_rank_check)?;
        let base_factor =
            cholesky_lower(&base).ok_or(KernelError::NotPositiveDefinite { iteration: 0 })?;
        let mut factor_rows = vec![0.; dim * dim];
        write_row_major(&base_factor, &mut factor_rows);

        log::debug!(
            "adaptive mvn kernel on {} (dim {}): scale {}, beta {}, initial {}, burnin {}, \
             every {}",
            parameter.name(),
            dim,
            settings.scale_factor,
            settings.beta,
            initial,
            settings.burnin,
            settings.every,
        );

        Ok(Self {
            parameter_name: parameter.name().to_string(),
            dim,
            weight: settings.weight,
            scale_factor: settings.scale_factor,
            beta: settings.beta,
            initial,
            mode: settings.mode,
            layout,
            state: AdaptationState::new(dim, settings.burnin, settings.every),
            blended: base.clone(),
            cholesky: base_factor.clone(),
            base,
            base_factor,
            factor_rows,
            epsilon: vec![0.; dim],
            values: vec![0.; dim],
            working: vec![0.; dim],
            candidate: vec![0.; dim],
        })
    }

    /// Advance the adaptation by one iteration at the working-coordinate
    /// point `working`.
    ///
    /// `propose` calls this before drawing. It is exposed so that the
    /// statistics can be driven by a fixed sequence of points.
    pub fn adapt(&mut self, working: &[f64]) -> Result<()> {
        if working.len() != self.dim {
            return Err(KernelError::DimensionMismatch {
                what: "working point",
                expected: self.dim,
                found: working.len(),
            });
        }
        self.state.advance(working);
        let iterations = self.state.iterations;

        if iterations == 1 {
            self.blended.clone_from(&self.base);
            self.cholesky.clone_from(&self.base_factor);
            write_row_major(&self.cholesky, &mut self.factor_rows);
        }

        if iterations > self.initial && iterations % self.state.every == 0 {
            self.refresh_factor()?;
        }
        Ok(())
    }

    fn refresh_factor(&mut self) -> Result<()> {
        let iteration = self.state.iterations;
        for i in 0..self.dim {
            for j in i..self.dim {
                let value = (1. - self.beta) * self.state.empirical[(i, j)]
                    + self.beta * self.base[(i, j)];
                self.blended[(i, j)] = value;
                self.blended[(j, i)] = value;
            }
        }
        match cholesky_lower(&self.blended) {
            Some(factor) => {
                self.cholesky = factor;
                write_row_major(&self.cholesky, &mut self.factor_rows);
                log::trace!(
                    "refreshed proposal factor of {} at iteration {}",
                    self.parameter_name,
                    iteration
                );
                Ok(())
            }
            None => {
                log::error!(
                    "blended covariance of {} is not positive definite at iteration {}",
                    self.parameter_name,
                    iteration
                );
                Err(KernelError::NotPositiveDefinite { iteration })
            }
        }
    }

    /// Warm start the statistics from earlier draws of the parameter.
    ///
    /// `samples[i]` holds the draws of coordinate `i` in model space. Only
    /// the first `n` draws of every coordinate are used, where `n` is the
    /// length of the shortest column. The base covariance is dropped from
    /// the blend afterwards.
    pub fn provide_samples(&mut self, samples: &[Vec<f64>]) -> Result<()> {
        if samples.len() != self.dim {
            return Err(KernelError::DimensionMismatch {
                what: "samples",
                expected: self.dim,
                found: samples.len(),
            });
        }
        let count = samples.iter().map(|column| column.len()).min().unwrap_or(0);
        if count == 0 {
            log::warn!("no samples provided for {}", self.parameter_name);
            return Ok(());
        }

        let dim = self.dim;
        let mut mean = vec![0.; dim];
        let mut cross = Mat::<f64>::zeros(dim, dim);
        for k in 0..count {
            self.values
                .iter_mut()
                .zip(samples.iter())
                .for_each(|(value, column)| *value = column[k]);
            self.layout.forward(&self.values, &mut self.working);
            for i in 0..dim {
                mean[i] += self.working[i];
                for j in i..dim {
                    cross[(i, j)] += self.working[i] * self.working[j];
                }
            }
        }

        let n = count as f64;
        mean.iter_mut().for_each(|val| *val /= n);
        for i in 0..dim {
            for j in i..dim {
                let value = cross[(i, j)] / n - mean[i] * mean[j];
                self.state.empirical[(i, j)] = value;
                self.state.empirical[(j, i)] = value;
            }
        }
        self.state.old_mean.copy_from_slice(&mean);
        self.state.new_mean.copy_from_slice(&mean);
        self.state.iterations = count as u64;
        self.state.updates = count as u64;
        self.beta = 0.;

        log::debug!(
            "warm started {} from {} samples",
            self.parameter_name,
            count
        );
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// The initial period after it was raised to at least `2 * dim`.
    pub fn initial(&self) -> u64 {
        self.initial
    }

    pub fn adaptation(&self) -> &AdaptationState {
        &self.state
    }

    pub fn iterations(&self) -> u64 {
        self.state.iterations()
    }

    pub fn updates(&self) -> u64 {
        self.state.updates()
    }

    pub fn running_mean(&self) -> &[f64] {
        self.state.running_mean()
    }

    pub fn running_cov(&self) -> &Mat<f64> {
        self.state.running_cov()
    }

    pub fn base_cov(&self) -> &Mat<f64> {
        &self.base
    }

    pub fn blended_cov(&self) -> &Mat<f64> {
        &self.blended
    }

    pub fn cholesky(&self) -> &Mat<f64> {
        &self.cholesky
    }

    pub fn transforms(&self) -> &TransformLayout {
        &self.layout
    }
}

fn base_covariance(base: &BaseCovariance, dim: usize, skip_rank_check: bool) -> Result<Mat<f64>> {
    match base {
        BaseCovariance::Scaled { coefficient } => {
            let diag = coefficient * coefficient / dim as f64;
            Ok(Mat::from_fn(dim, dim, |i, j| if i == j { diag } else { 0. }))
        }
        BaseCovariance::Variance(rows) => {
            let size = rows.len();
            if let Some(row) = rows.iter().find(|row| row.len() != size) {
                return Err(KernelError::NotSquare {
                    rows: size,
                    cols: row.len(),
                });
            }
            if size != dim {
                return Err(KernelError::DimensionMismatch {
                    what: "base covariance",
                    expected: dim,
                    found: size,
                });
            }
            let mat = Mat::from_fn(dim, dim, |i, j| rows[i][j]);
            if !skip_rank_check {
                check_rank(&mat, dim)?;
            }
            Ok(mat)
        }
        BaseCovariance::XtXInverse(rows) => {
            if let Some(row) = rows.iter().find(|row| row.len() != dim) {
                return Err(KernelError::DimensionMismatch {
                    what: "design matrix columns",
                    expected: dim,
                    found: row.len(),
                });
            }
            let x = Mat::from_fn(rows.len(), dim, |i, j| rows[i][j]);
            if !skip_rank_check {
                check_rank(&(x.transpose() * &x), dim)?;
            }
            xtx_inverse(&x).ok_or_else(|| KernelError::RankDeficient {
                rank: symmetric_rank(&(x.transpose() * &x)).unwrap_or(0),
                dim,
            })
        }
    }
}

fn check_rank(mat: &Mat<f64>, dim: usize) -> Result<()> {
    let rank = symmetric_rank(mat).unwrap_or(0);
    if rank != dim {
        return Err(KernelError::RankDeficient { rank, dim });
    }
    Ok(())
}

impl Kernel for AdaptiveMvnKernel {
    fn propose<P, R>(&mut self, state: &mut P, rng: &mut R) -> Result<Proposal>
    where
        P: Parameter + ?Sized,
        R: Rng + ?Sized,
    {
        if state.dim() != self.dim {
            return Err(KernelError::DimensionMismatch {
                what: "parameter",
                expected: self.dim,
                found: state.dim(),
            });
        }

        state.read_values(&mut self.values);
        self.layout.forward(&self.values, &mut self.working);

        // The statistics see the point before the move.
        let working = std::mem::take(&mut self.working);
        let adapted = self.adapt(&working);
        self.working = working;
        adapted?;

        let scale = self.scale_factor;
        self.epsilon
            .iter_mut()
            .for_each(|eps| *eps = scale * rng.sample::<f64, _>(StandardNormal));

        self.candidate.copy_from_slice(&self.working);
        lower_triangular_mul_add(&self.factor_rows, &self.epsilon, &mut self.candidate);

        let old_jacobian = self.layout.log_jacobian(&self.values);
        self.layout.backward(&self.candidate, &mut self.values);
        // The adaptation above has counted this iteration either way.
        let outside = self
            .values
            .iter()
            .enumerate()
            .any(|(i, &value)| !state.bounds(i).contains(value));
        if outside {
            return Ok(Proposal::Rejected);
        }
        state.write_values(&self.values);

        if self.layout.is_identity() {
            return Ok(Proposal::Proposed(0.));
        }
        Ok(Proposal::Proposed(
            old_jacobian - self.layout.log_jacobian(&self.values),
        ))
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn name(&self) -> String {
        format!("adaptableVarianceMultivariateNormal({})", self.parameter_name)
    }
}

impl Tunable for AdaptiveMvnKernel {
    fn log_scale(&self) -> f64 {
        self.scale_factor.ln()
    }

    fn set_log_scale(&mut self, value: f64) {
        self.scale_factor = value.exp();
    }

    fn scale_name(&self) -> &'static str {
        "scaleFactor"
    }

    fn mode(&self) -> CoercionMode {
        self.mode
    }
}
