use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adaptive_mvn::AdaptiveMvnKernel;
use crate::kernel::{check_weight, CoercionMode, Kernel, KernelError, Proposal, Result, Tunable};
use crate::parameter::Parameter;
use crate::random_walk::RandomWalkKernel;

/// Any of the kernels of this crate.
#[derive(Debug, Clone)]
pub enum AnyKernel {
    RandomWalk(RandomWalkKernel),
    AdaptiveMvn(AdaptiveMvnKernel),
    Composite(CompositeKernel),
}

impl From<RandomWalkKernel> for AnyKernel {
    fn from(kernel: RandomWalkKernel) -> Self {
        AnyKernel::RandomWalk(kernel)
    }
}

impl From<AdaptiveMvnKernel> for AnyKernel {
    fn from(kernel: AdaptiveMvnKernel) -> Self {
        AnyKernel::AdaptiveMvn(kernel)
    }
}

impl From<CompositeKernel> for AnyKernel {
    fn from(kernel: CompositeKernel) -> Self {
        AnyKernel::Composite(kernel)
    }
}

impl AnyKernel {
    pub fn mode(&self) -> CoercionMode {
        match self {
            AnyKernel::RandomWalk(kernel) => kernel.mode(),
            AnyKernel::AdaptiveMvn(kernel) => kernel.mode(),
            AnyKernel::Composite(kernel) => kernel.mode,
        }
    }

    pub fn is_tunable(&self) -> bool {
        match self {
            AnyKernel::RandomWalk(_) | AnyKernel::AdaptiveMvn(_) => true,
            AnyKernel::Composite(kernel) => kernel.has_tunable(),
        }
    }

    /// The kernel whose scale a tuning step reads and writes.
    ///
    /// A composite picks one of its tunable members at random and
    /// remembers the choice.
    pub fn tunable<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<&mut dyn Tunable> {
        match self {
            AnyKernel::RandomWalk(kernel) => Ok(kernel as &mut dyn Tunable),
            AnyKernel::AdaptiveMvn(kernel) => Ok(kernel as &mut dyn Tunable),
            AnyKernel::Composite(kernel) => kernel.select_tunable(rng),
        }
    }

    /// The kernel itself if it is a tunable leaf.
    pub fn as_tunable(&self) -> Option<&dyn Tunable> {
        match self {
            AnyKernel::RandomWalk(kernel) => Some(kernel as &dyn Tunable),
            AnyKernel::AdaptiveMvn(kernel) => Some(kernel as &dyn Tunable),
            AnyKernel::Composite(_) => None,
        }
    }

    /// The kernel chosen by the last call to `tunable`.
    pub fn selected_tunable(&mut self) -> Result<&mut dyn Tunable> {
        match self {
            AnyKernel::RandomWalk(kernel) => Ok(kernel as &mut dyn Tunable),
            AnyKernel::AdaptiveMvn(kernel) => Ok(kernel as &mut dyn Tunable),
            AnyKernel::Composite(kernel) => kernel.selected_tunable(),
        }
    }
}

impl Kernel for AnyKernel {
    fn propose<P, R>(&mut self, state: &mut P, rng: &mut R) -> Result<Proposal>
    where
        P: Parameter + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            AnyKernel::RandomWalk(kernel) => kernel.propose(state, rng),
            AnyKernel::AdaptiveMvn(kernel) => kernel.propose(state, rng),
            AnyKernel::Composite(kernel) => kernel.propose(state, rng),
        }
    }

    fn weight(&self) -> f64 {
        match self {
            AnyKernel::RandomWalk(kernel) => kernel.weight(),
            AnyKernel::AdaptiveMvn(kernel) => kernel.weight(),
            AnyKernel::Composite(kernel) => kernel.weight(),
        }
    }

    fn name(&self) -> String {
        match self {
            AnyKernel::RandomWalk(kernel) => kernel.name(),
            AnyKernel::AdaptiveMvn(kernel) => kernel.name(),
            AnyKernel::Composite(kernel) => kernel.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeSettings {
    pub weight: f64,
    pub mode: CoercionMode,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self {
            weight: 1.,
            mode: CoercionMode::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    kernel: AnyKernel,
    tunable: bool,
}

/// Applies all of its members in order and sums their corrections.
///
/// If a member rejects, the remaining members still run and the composite
/// reports the rejection afterwards.
#[derive(Debug, Clone)]
pub struct CompositeKernel {
    members: Vec<Member>,
    weight: f64,
    mode: CoercionMode,
    selected: Option<usize>,
}

impl CompositeKernel {
    /// Every member that can be tuned takes part in tuning.
    pub fn new(kernels: Vec<AnyKernel>, settings: CompositeSettings) -> Result<Self> {
        let members = kernels
            .into_iter()
            .map(|kernel| {
                let tunable = kernel.is_tunable();
                (kernel, tunable)
            })
            .collect();
        Self::with_tuning_flags(members, settings)
    }

    /// Members paired with whether they take part in tuning.
    ///
    /// Members whose own coercion mode is `Off` never take part. The others
    /// are tuned whenever the mode of the composite is active.
    pub fn with_tuning_flags(
        members: Vec<(AnyKernel, bool)>,
        settings: CompositeSettings,
    ) -> Result<Self> {
        check_weight(settings.weight)?;
        let members = members
            .into_iter()
            .map(|(kernel, tunable)| Member {
                tunable: tunable && kernel.is_tunable() && kernel.mode() != CoercionMode::Off,
                kernel,
            })
            .collect();
        Ok(Self {
            members,
            weight: settings.weight,
            mode: settings.mode,
            selected: None,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &AnyKernel> {
        self.members.iter().map(|member| &member.kernel)
    }

    pub fn has_tunable(&self) -> bool {
        self.members.iter().any(|member| member.tunable)
    }

    /// Index of the member chosen by the last tuning read.
    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Pick one tunable member uniformly at random.
    pub fn select_tunable<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<&mut dyn Tunable> {
        let candidates = self
            .members
            .iter()
            .positions(|member| member.tunable)
            .collect_vec();
        if candidates.is_empty() {
            return Err(KernelError::NotTunable);
        }
        let index = candidates[rng.random_range(0..candidates.len())];
        self.selected = Some(index);
        self.members[index].kernel.tunable(rng)
    }

    pub fn selected_tunable(&mut self) -> Result<&mut dyn Tunable> {
        match self.selected {
            Some(index) => self.members[index].kernel.selected_tunable(),
            None => Err(KernelError::NotTunable),
        }
    }

    /// Log scale of a freshly selected member.
    pub fn log_scale<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<f64> {
        Ok(self.select_tunable(rng)?.log_scale())
    }

    /// Set the log scale of the member chosen by the last read.
    pub fn set_log_scale(&mut self, value: f64) -> Result<()> {
        self.selected_tunable()?.set_log_scale(value);
        Ok(())
    }
}

impl Kernel for CompositeKernel {
    fn propose<P, R>(&mut self, state: &mut P, rng: &mut R) -> Result<Proposal>
    where
        P: Parameter + ?Sized,
        R: Rng + ?Sized,
    {
        let mut total = 0.;
        let mut rejected = false;
        for member in self.members.iter_mut() {
            match member.kernel.propose(state, rng)? {
                Proposal::Proposed(log_hastings) => total += log_hastings,
                Proposal::Rejected => {
                    if !rejected {
                        log::debug!(
                            "{} rejected inside composite, running remaining members",
                            member.kernel.name()
                        );
                    }
                    rejected = true;
                }
            }
        }
        if rejected {
            return Ok(Proposal::Rejected);
        }
        Ok(Proposal::Proposed(total))
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn name(&self) -> String {
        format!(
            "composite({})",
            self.members.iter().map(|member| member.kernel.name()).join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use crate::parameter::ParameterVector;
    use crate::random_walk::{BoundaryCondition, RandomWalkSettings};
    use crate::transform::Transform;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn walker(param: &ParameterVector, index: usize, transform: Transform) -> RandomWalkKernel {
        let mut transforms = vec![Transform::None; param.values().len()];
        transforms[index] = transform;
        RandomWalkKernel::new(
            param,
            RandomWalkSettings {
                indices: Some(vec![index]),
                transforms: Some(transforms),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn corrections_add_up() -> anyhow::Result<()> {
        for transform in [Transform::None, Transform::Log] {
            let param =
                ParameterVector::with_uniform_bounds("theta", vec![1., 2.], Bounds::positive());
            let first = walker(&param, 0, transform.clone());
            let second = walker(&param, 1, transform.clone());

            let mut composite = CompositeKernel::new(
                vec![first.clone().into(), second.clone().into()],
                CompositeSettings::default(),
            )?;

            let mut joint_param = param.clone();
            let mut rng = StdRng::seed_from_u64(42);
            let joint = composite.propose(&mut joint_param, &mut rng)?;

            let mut single_param = param.clone();
            let mut rng = StdRng::seed_from_u64(42);
            let (mut first, mut second) = (first, second);
            let a = first.propose(&mut single_param, &mut rng)?;
            let b = second.propose(&mut single_param, &mut rng)?;

            assert_eq!(joint_param, single_param);
            assert_relative_eq!(
                joint.log_hastings().unwrap(),
                a.log_hastings().unwrap() + b.log_hastings().unwrap(),
                epsilon = 1e-12
            );
            if transform.is_identity() {
                assert_eq!(joint, Proposal::Proposed(0.));
            }
        }
        Ok(())
    }

    #[test]
    fn rejection_runs_remaining_members() -> anyhow::Result<()> {
        let mut param = ParameterVector::with_bounds(
            "theta",
            vec![0.5, 0.5],
            vec![Bounds::new(0.5, 0.5)?, Bounds::unbounded()],
        )?;
        let stuck = RandomWalkKernel::new(
            &param,
            RandomWalkSettings {
                indices: Some(vec![0]),
                boundary: BoundaryCondition::Absorbing,
                ..Default::default()
            },
        )?;
        let free = walker(&param, 1, Transform::None);
        let mut composite =
            CompositeKernel::new(vec![stuck.into(), free.into()], CompositeSettings::default())?;

        let mut rng = StdRng::seed_from_u64(42);
        let proposal = composite.propose(&mut param, &mut rng)?;
        assert_eq!(proposal, Proposal::Rejected);
        assert_eq!(param.value(0), 0.5);
        assert!(param.value(1) != 0.5);
        Ok(())
    }

    #[test]
    fn tuning_needs_a_tunable_member() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0.]);
        let kernel = walker(&param, 0, Transform::None);
        let mut composite = CompositeKernel::with_tuning_flags(
            vec![(kernel.into(), false)],
            CompositeSettings::default(),
        )?;
        let mut rng = StdRng::seed_from_u64(42);
        assert!(matches!(
            composite.log_scale(&mut rng),
            Err(KernelError::NotTunable)
        ));
        assert!(matches!(
            composite.set_log_scale(1.),
            Err(KernelError::NotTunable)
        ));
        assert!(!AnyKernel::from(composite).is_tunable());
        Ok(())
    }

    #[test]
    fn members_with_coercion_off_are_skipped() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0., 0.]);
        let fixed = RandomWalkKernel::new(
            &param,
            RandomWalkSettings {
                indices: Some(vec![0]),
                mode: CoercionMode::Off,
                ..Default::default()
            },
        )?;
        let free = walker(&param, 1, Transform::None);
        let mut composite = CompositeKernel::new(
            vec![fixed.clone().into(), free.into()],
            CompositeSettings::default(),
        )?;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            composite.log_scale(&mut rng)?;
            assert_eq!(composite.selected(), Some(1));
        }

        let mut only_fixed =
            CompositeKernel::new(vec![fixed.into()], CompositeSettings::default())?;
        assert!(!only_fixed.has_tunable());
        assert!(matches!(
            only_fixed.log_scale(&mut rng),
            Err(KernelError::NotTunable)
        ));
        Ok(())
    }

    #[test]
    fn write_goes_to_selected_member() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0., 0.]);
        let mut composite = CompositeKernel::new(
            vec![
                walker(&param, 0, Transform::None).into(),
                walker(&param, 1, Transform::None).into(),
            ],
            CompositeSettings::default(),
        )?;
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = [false; 2];
        for _ in 0..50 {
            assert_eq!(composite.log_scale(&mut rng)?, 0.);
            let selected = composite.selected().unwrap();
            seen[selected] = true;
            composite.set_log_scale(1.)?;
            let scales: Vec<f64> = composite
                .members()
                .map(|member| match member {
                    AnyKernel::RandomWalk(kernel) => kernel.log_scale(),
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(scales[selected], 1.);
            assert_eq!(scales[1 - selected], 0.);
            composite.set_log_scale(0.)?;
        }
        assert_eq!(seen, [true, true]);
        Ok(())
    }

    #[test]
    fn nested_names() -> anyhow::Result<()> {
        let param = ParameterVector::new("theta", vec![0., 0.]);
        let inner = CompositeKernel::new(
            vec![walker(&param, 1, Transform::None).into()],
            CompositeSettings::default(),
        )?;
        let outer = CompositeKernel::new(
            vec![walker(&param, 0, Transform::None).into(), inner.into()],
            CompositeSettings {
                weight: 2.,
                ..Default::default()
            },
        )?;
        assert_eq!(
            outer.name(),
            "composite(randomWalk(theta), composite(randomWalk(theta)))"
        );
        assert_eq!(outer.weight(), 2.);
        assert_eq!(outer.len(), 2);
        Ok(())
    }
}
