use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::coercion::{
    acceptance_probability, coerce, performance_suggestion, AcceptanceTracker, CoercionSettings,
};
use crate::composite::AnyKernel;
use crate::kernel::{Kernel, KernelError, Proposal, Result};
use crate::parameter::{Parameter, ParameterVector};

/// Unnormalized log density the chain samples from.
pub trait Target {
    fn log_density(&self, values: &[f64]) -> f64;
}

impl<T: Target + ?Sized> Target for &T {
    fn log_density(&self, values: &[f64]) -> f64 {
        (**self).log_density(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChainSettings {
    pub num_draws: u64,
    pub seed: u64,
    pub coercion: CoercionSettings,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            num_draws: 1000,
            seed: 0,
            coercion: CoercionSettings::default(),
        }
    }
}

/// Kernels with their acceptance bookkeeping, picked in proportion to
/// their weights.
#[derive(Debug, Clone)]
pub struct OperatorSchedule {
    kernels: Vec<AnyKernel>,
    trackers: Vec<AcceptanceTracker>,
    total_weight: f64,
}

impl OperatorSchedule {
    pub fn new(kernels: Vec<AnyKernel>) -> Result<Self> {
        let total_weight: f64 = kernels.iter().map(|kernel| kernel.weight()).sum();
        if kernels.is_empty() || !(total_weight.is_finite() && total_weight > 0.) {
            return Err(KernelError::InvalidWeight(total_weight));
        }
        let trackers = vec![AcceptanceTracker::new(); kernels.len()];
        Ok(Self {
            kernels,
            trackers,
            total_weight,
        })
    }

    pub fn next_index<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let mut remaining = rng.random::<f64>() * self.total_weight;
        for (index, kernel) in self.kernels.iter().enumerate() {
            remaining -= kernel.weight();
            if remaining < 0. {
                return index;
            }
        }
        self.kernels.len() - 1
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernel(&self, index: usize) -> &AnyKernel {
        &self.kernels[index]
    }

    pub fn kernel_mut(&mut self, index: usize) -> &mut AnyKernel {
        &mut self.kernels[index]
    }

    pub fn tracker(&self, index: usize) -> &AcceptanceTracker {
        &self.trackers[index]
    }

    pub fn kernels(&self) -> &[AnyKernel] {
        &self.kernels
    }

    /// Name, acceptance rate and tuning suggestion of every kernel.
    pub fn summary(&self) -> Vec<(String, f64, Option<String>)> {
        self.kernels
            .iter()
            .zip(self.trackers.iter())
            .map(|(kernel, tracker)| {
                let rate = tracker.acceptance_rate();
                let suggestion = kernel
                    .as_tunable()
                    .and_then(|tunable| performance_suggestion(tunable, rate));
                (kernel.name(), rate, suggestion)
            })
            .collect()
    }
}

/// Outcome of a single step of the chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    pub kernel: usize,
    pub proposal: Proposal,
    pub accepted: bool,
    pub log_density: f64,
}

/// The draws of a run, one entry per step.
#[derive(Debug, Clone, Default)]
pub struct Draws {
    pub values: Vec<Box<[f64]>>,
    pub accepted: Vec<bool>,
}

impl Draws {
    /// Fraction of accepted steps among `range`.
    pub fn acceptance_rate(&self, range: std::ops::Range<usize>) -> f64 {
        let steps = &self.accepted[range];
        if steps.is_empty() {
            return 0.;
        }
        steps.iter().filter(|&&accepted| accepted).count() as f64 / steps.len() as f64
    }
}

/// A Metropolis-Hastings chain over one parameter vector.
pub struct MetropolisChain<T, P, R>
where
    T: Target,
    P: Parameter,
    R: Rng,
{
    target: T,
    state: P,
    schedule: OperatorSchedule,
    rng: R,
    coercion: CoercionSettings,
    log_density: f64,
    snapshot: Vec<f64>,
    values: Vec<f64>,
    draw_count: u64,
}

impl<T, P, R> MetropolisChain<T, P, R>
where
    T: Target,
    P: Parameter,
    R: Rng,
{
    pub fn new(
        target: T,
        state: P,
        schedule: OperatorSchedule,
        rng: R,
        coercion: CoercionSettings,
    ) -> Self {
        let dim = state.dim();
        let mut values = vec![0.; dim];
        state.read_values(&mut values);
        let log_density = target.log_density(&values);
        Self {
            target,
            state,
            schedule,
            rng,
            coercion,
            log_density,
            snapshot: vec![0.; dim],
            values,
            draw_count: 0,
        }
    }

    /// Propose with one kernel, then accept or restore.
    pub fn step(&mut self) -> Result<StepInfo> {
        let index = self.schedule.next_index(&mut self.rng);
        self.state.read_values(&mut self.snapshot);

        let proposal = self.schedule.kernels[index].propose(&mut self.state, &mut self.rng)?;

        let (accepted, log_ratio, new_density) = match proposal {
            Proposal::Rejected => (false, None, self.log_density),
            Proposal::Proposed(log_hastings) => {
                self.state.read_values(&mut self.values);
                let mut density = self.target.log_density(&self.values);
                if density.is_nan() || density == f64::INFINITY {
                    density = f64::NEG_INFINITY;
                }
                let log_ratio = density - self.log_density + log_hastings;
                let accepted = log_ratio >= 0. || self.rng.random::<f64>().ln() < log_ratio;
                (accepted, Some(log_ratio), density)
            }
        };

        if accepted {
            self.log_density = new_density;
        } else {
            self.state.write_values(&self.snapshot);
        }

        self.schedule.trackers[index].record_proposal(&proposal, log_ratio, accepted);

        let kernel = &mut self.schedule.kernels[index];
        if kernel.mode().is_active(self.coercion.enabled) && kernel.is_tunable() {
            let count = self.schedule.trackers[index].count();
            let tunable = kernel.tunable(&mut self.rng)?;
            coerce(
                tunable,
                acceptance_probability(log_ratio),
                count,
                self.coercion.schedule,
            );
        }

        self.draw_count += 1;
        Ok(StepInfo {
            kernel: index,
            proposal,
            accepted,
            log_density: self.log_density,
        })
    }

    pub fn run(&mut self, num_draws: u64) -> Result<Draws> {
        let mut draws = Draws::default();
        for _ in 0..num_draws {
            let info = self.step()?;
            self.state.read_values(&mut self.values);
            draws.values.push(self.values.clone().into_boxed_slice());
            draws.accepted.push(info.accepted);
        }
        self.log_summary();
        Ok(draws)
    }

    pub fn log_summary(&self) {
        for (name, rate, suggestion) in self.schedule.summary() {
            match suggestion {
                Some(suggestion) => log::info!("{name}: acceptance {rate:.4}. {suggestion}"),
                None => log::info!("{name}: acceptance {rate:.4}"),
            }
        }
    }

    pub fn state(&self) -> &P {
        &self.state
    }

    pub fn log_density(&self) -> f64 {
        self.log_density
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn into_parts(self) -> (P, OperatorSchedule) {
        (self.state, self.schedule)
    }
}

/// Result of one chain of `sample_parallel`.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub chain: u64,
    pub draws: Draws,
    pub state: ParameterVector,
    pub schedule: OperatorSchedule,
}

/// Run `num_chains` independent chains on the rayon thread pool.
///
/// `init` builds the start state and kernels of every chain, so that no
/// kernel is shared between chains. Chain `i` draws from the stream `i`
/// of a ChaCha generator seeded with `settings.seed`.
pub fn sample_parallel<T, F>(
    target: &T,
    num_chains: u64,
    settings: &ChainSettings,
    init: F,
) -> Result<Vec<ChainResult>>
where
    T: Target + Sync + ?Sized,
    F: Fn(u64) -> Result<(ParameterVector, OperatorSchedule)> + Sync,
{
    (0..num_chains)
        .into_par_iter()
        .map(|chain| {
            let (state, schedule) = init(chain)?;
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain);
            let mut sampler = MetropolisChain::new(target, state, schedule, rng, settings.coercion);
            let draws = sampler.run(settings.num_draws)?;
            let (state, schedule) = sampler.into_parts();
            Ok(ChainResult {
                chain,
                draws,
                state,
                schedule,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive_mvn::{AdaptiveMvnKernel, AdaptiveMvnSettings};
    use crate::bounds::Bounds;
    use crate::composite::{CompositeKernel, CompositeSettings};
    use crate::random_walk::{RandomWalkKernel, RandomWalkSettings};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;

    struct StandardNormal;

    impl Target for StandardNormal {
        fn log_density(&self, values: &[f64]) -> f64 {
            values.iter().map(|x| -0.5 * x * x).sum()
        }
    }

    fn walker(param: &ParameterVector, weight: f64) -> AnyKernel {
        RandomWalkKernel::new(
            param,
            RandomWalkSettings {
                weight,
                ..Default::default()
            },
        )
        .unwrap()
        .into()
    }

    #[test]
    fn schedule_follows_weights() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0.]);
        let schedule = OperatorSchedule::new(vec![walker(&param, 1.), walker(&param, 3.)])?;
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 2];
        for _ in 0..10_000 {
            counts[schedule.next_index(&mut rng)] += 1;
        }
        let share = counts[1] as f64 / 10_000.;
        assert!((share - 0.75).abs() < 0.03, "share {share}");
        Ok(())
    }

    #[test]
    fn empty_schedule() {
        assert!(matches!(
            OperatorSchedule::new(vec![]),
            Err(KernelError::InvalidWeight(_))
        ));
    }

    #[test]
    fn rejected_steps_restore_the_state() -> anyhow::Result<()> {
        let bounds = Bounds::new(0.5, 0.5)?;
        let param = ParameterVector::with_uniform_bounds("theta", vec![0.5], bounds);
        let kernel = RandomWalkKernel::new(
            &param,
            RandomWalkSettings {
                boundary: crate::random_walk::BoundaryCondition::Absorbing,
                ..Default::default()
            },
        )?;
        let schedule = OperatorSchedule::new(vec![kernel.into()])?;
        let mut chain = MetropolisChain::new(
            StandardNormal,
            param,
            schedule,
            StdRng::seed_from_u64(42),
            CoercionSettings::default(),
        );
        for _ in 0..10 {
            let info = chain.step()?;
            assert_eq!(info.proposal, Proposal::Rejected);
            assert!(!info.accepted);
        }
        assert_eq!(chain.state().values(), &[0.5]);
        assert_eq!(chain.schedule().tracker(0).rejected(), 10);
        // Every rejection counts as probability zero and shrinks the window.
        let window = match chain.schedule().kernel(0) {
            AnyKernel::RandomWalk(kernel) => kernel.window_size(),
            _ => unreachable!(),
        };
        assert!(window < 1.);
        Ok(())
    }

    #[test]
    fn composite_rejection_restores_every_member() -> anyhow::Result<()> {
        let param = ParameterVector::with_bounds(
            "theta",
            vec![0.5, 0.],
            vec![Bounds::new(0.5, 0.5)?, Bounds::unbounded()],
        )?;
        let stuck = RandomWalkKernel::new(
            &param,
            RandomWalkSettings {
                indices: Some(vec![0]),
                boundary: crate::random_walk::BoundaryCondition::Absorbing,
                ..Default::default()
            },
        )?;
        let free = RandomWalkKernel::new(
            &param,
            RandomWalkSettings {
                indices: Some(vec![1]),
                ..Default::default()
            },
        )?;
        let composite = CompositeKernel::new(
            vec![stuck.into(), free.into()],
            CompositeSettings::default(),
        )?;
        let mut chain = MetropolisChain::new(
            StandardNormal,
            param,
            OperatorSchedule::new(vec![composite.into()])?,
            StdRng::seed_from_u64(42),
            CoercionSettings::default(),
        );
        for _ in 0..10 {
            assert_eq!(chain.step()?.proposal, Proposal::Rejected);
            assert_eq!(chain.state().values(), &[0.5, 0.]);
        }
        Ok(())
    }

    #[test]
    fn coercion_can_be_disabled() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0.]);
        let schedule = OperatorSchedule::new(vec![walker(&param, 1.)])?;
        let mut chain = MetropolisChain::new(
            StandardNormal,
            param,
            schedule,
            StdRng::seed_from_u64(42),
            CoercionSettings {
                enabled: false,
                ..Default::default()
            },
        );
        chain.run(100)?;
        let window = match chain.schedule().kernel(0) {
            AnyKernel::RandomWalk(kernel) => kernel.window_size(),
            _ => unreachable!(),
        };
        assert_eq!(window, 1.);
        assert_eq!(chain.draw_count(), 100);
        Ok(())
    }

    #[test]
    fn samples_standard_normal() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0.; 2]);
        let kernel = AdaptiveMvnKernel::new(
            &param,
            AdaptiveMvnSettings {
                initial: 100,
                ..Default::default()
            },
        )?;
        let schedule = OperatorSchedule::new(vec![kernel.into()])?;
        let mut chain = MetropolisChain::new(
            StandardNormal,
            param,
            schedule,
            StdRng::seed_from_u64(42),
            CoercionSettings::default(),
        );
        let draws = chain.run(20_000)?;
        let kept = &draws.values[2000..];
        let n = kept.len() as f64;
        let mean: f64 = kept.iter().map(|draw| draw[0]).sum::<f64>() / n;
        let var: f64 = kept.iter().map(|draw| (draw[0] - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.15, "mean {mean}");
        assert!((var - 1.).abs() < 0.2, "variance {var}");
        let expected = StandardNormal.log_density(chain.state().values());
        assert_relative_eq!(chain.log_density(), expected);
        Ok(())
    }

    #[test]
    fn parallel_chains_are_reproducible() -> anyhow::Result<()> {
        let settings = ChainSettings {
            num_draws: 200,
            seed: 3,
            ..Default::default()
        };
        let init = |_chain: u64| -> Result<(ParameterVector, OperatorSchedule)> {
            let param = ParameterVector::new("theta", vec![0.; 2]);
            let kernel = RandomWalkKernel::new(&param, RandomWalkSettings::default())?;
            let schedule = OperatorSchedule::new(vec![kernel.into()])?;
            Ok((param, schedule))
        };
        let first = sample_parallel(&StandardNormal, 3, &settings, init)?;
        let second = sample_parallel(&StandardNormal, 3, &settings, init)?;
        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.chain, b.chain);
            assert_eq!(a.draws.values, b.draws.values);
        }
        assert!(first[0].draws.values != first[1].draws.values);
        Ok(())
    }
}
