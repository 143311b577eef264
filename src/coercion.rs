use serde::{Deserialize, Serialize};

use crate::kernel::{Proposal, Tunable};

/// Shrinks the coercion step as a kernel accumulates operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizationSchedule {
    #[default]
    Log,
    Sqrt,
    Linear,
}

impl OptimizationSchedule {
    pub fn transform(&self, count: u64) -> f64 {
        let count = count as f64;
        match self {
            OptimizationSchedule::Log => count.ln(),
            OptimizationSchedule::Sqrt => count.sqrt(),
            OptimizationSchedule::Linear => count,
        }
    }
}

/// Settings for the step size coercion of the driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoercionSettings {
    /// Global switch, consulted by kernels in `CoercionMode::Default`.
    pub enabled: bool,
    pub schedule: OptimizationSchedule,
}

impl Default for CoercionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: OptimizationSchedule::default(),
        }
    }
}

/// Probability of accepting a proposal with log ratio `log_ratio`.
///
/// A structurally rejected proposal has probability zero.
pub fn acceptance_probability(log_ratio: Option<f64>) -> f64 {
    match log_ratio {
        Some(log_ratio) if log_ratio.is_nan() => 0.,
        Some(log_ratio) => log_ratio.min(0.).exp(),
        None => 0.,
    }
}

/// Robbins-Monro update of the log scale of one kernel.
///
/// `count` is the number of operations the kernel has performed including
/// the current one. Returns whether the scale was changed.
pub fn coerce(
    tunable: &mut dyn Tunable,
    accept_prob: f64,
    count: u64,
    schedule: OptimizationSchedule,
) -> bool {
    let p = tunable.log_scale();
    let step = 1. / (schedule.transform(count) + 1.);
    let new_p = p + step * (accept_prob - tunable.target_acceptance());
    if !new_p.is_finite() {
        return false;
    }
    tunable.set_log_scale(new_p);
    true
}

/// Suggested scale for a kernel that accepted at `rate` while aiming for
/// `target`.
pub fn optimized_scale(scale: f64, rate: f64, target: f64) -> f64 {
    if rate <= 0. {
        return scale / 2.;
    }
    scale * (rate / target).clamp(0.5, 2.)
}

/// A hint for the user if the observed acceptance rate is outside the
/// good band of the kernel.
pub fn performance_suggestion(tunable: &dyn Tunable, rate: f64) -> Option<String> {
    let levels = tunable.acceptance_levels();
    if levels.is_good(rate) {
        return None;
    }
    let scale = optimized_scale(tunable.raw_scale(), rate, tunable.target_acceptance());
    Some(format!(
        "Try setting {} to about {:.5}",
        tunable.scale_name(),
        scale
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }
}

/// Accept and reject counts of one kernel.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceTracker {
    accepted: u64,
    rejected: u64,
    accept_prob: RunningMean,
}

impl AcceptanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, accepted: bool, accept_prob: f64) {
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
        self.accept_prob.add(accept_prob);
    }

    /// Record the outcome of `proposal`, with the log Metropolis ratio if
    /// the target was evaluated.
    pub fn record_proposal(&mut self, proposal: &Proposal, log_ratio: Option<f64>, accepted: bool) {
        let log_ratio = match proposal {
            Proposal::Rejected => None,
            Proposal::Proposed(_) => log_ratio,
        };
        self.record(accepted, acceptance_probability(log_ratio));
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn count(&self) -> u64 {
        self.accepted + self.rejected
    }

    pub fn acceptance_rate(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.;
        }
        self.accepted as f64 / count as f64
    }

    pub fn mean_acceptance_probability(&self) -> f64 {
        self.accept_prob.current()
    }

    pub fn reset(&mut self) {
        self.accepted = 0;
        self.rejected = 0;
        self.accept_prob.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    struct Scale {
        log_scale: f64,
    }

    impl Tunable for Scale {
        fn log_scale(&self) -> f64 {
            self.log_scale
        }

        fn set_log_scale(&mut self, value: f64) {
            self.log_scale = value;
        }

        fn scale_name(&self) -> &'static str {
            "scaleFactor"
        }
    }

    fn scale() -> Scale {
        Scale { log_scale: 0. }
    }

    #[test]
    fn schedules() {
        assert_eq!(OptimizationSchedule::Log.transform(1), 0.);
        assert_relative_eq!(OptimizationSchedule::Sqrt.transform(16), 4.);
        assert_relative_eq!(OptimizationSchedule::Linear.transform(7), 7.);
    }

    #[test]
    fn probability() {
        assert_eq!(acceptance_probability(None), 0.);
        assert_eq!(acceptance_probability(Some(2.)), 1.);
        assert_relative_eq!(acceptance_probability(Some(-1.)), (-1f64).exp());
        assert_eq!(acceptance_probability(Some(f64::NAN)), 0.);
    }

    #[test]
    fn coercion_moves_toward_target() {
        let schedule = OptimizationSchedule::default();
        let mut tunable = scale();

        assert!(coerce(&mut tunable, 1., 1, schedule));
        assert_relative_eq!(tunable.log_scale(), 1. - 0.234);

        let before = tunable.log_scale();
        coerce(&mut tunable, 0., 10, schedule);
        let step = 1. / (10f64.ln() + 1.);
        assert_relative_eq!(tunable.log_scale(), before - step * 0.234);
    }

    #[test]
    fn linear_schedule_shrinks_faster() {
        let mut log = scale();
        let mut linear = scale();
        coerce(&mut log, 1., 100, OptimizationSchedule::Log);
        coerce(&mut linear, 1., 100, OptimizationSchedule::Linear);
        assert!(linear.log_scale() < log.log_scale());
        assert_relative_eq!(linear.log_scale(), 0.766 / 101., epsilon = 1e-12);
    }

    #[test]
    fn non_finite_update_is_ignored() {
        let mut tunable = scale();
        assert!(!coerce(&mut tunable, f64::NAN, 1, OptimizationSchedule::Log));
        assert_eq!(tunable.log_scale(), 0.);
    }

    #[test]
    fn suggestions() {
        assert_relative_eq!(optimized_scale(1., 0., 0.234), 0.5);
        assert_relative_eq!(optimized_scale(1., 0.9, 0.234), 2.);
        assert_relative_eq!(optimized_scale(2., 0.117, 0.234), 1.);

        let tunable = scale();
        assert_eq!(performance_suggestion(&tunable, 0.25), None);
        assert_eq!(
            performance_suggestion(&tunable, 0.),
            Some("Try setting scaleFactor to about 0.50000".to_string())
        );
    }

    #[test]
    fn tracker() {
        let mut tracker = AcceptanceTracker::new();
        assert_eq!(tracker.acceptance_rate(), 0.);
        tracker.record(true, 1.);
        tracker.record(false, 0.5);
        tracker.record_proposal(&Proposal::Rejected, Some(3.), false);
        assert_eq!(tracker.accepted(), 1);
        assert_eq!(tracker.rejected(), 2);
        assert_eq!(tracker.count(), 3);
        assert_relative_eq!(tracker.acceptance_rate(), 1. / 3.);
        assert_relative_eq!(tracker.mean_acceptance_probability(), 0.5);
        tracker.reset();
        assert_eq!(tracker.count(), 0);
    }
}
