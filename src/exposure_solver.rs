// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt::{Debug, Display};
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::device_traits::{ApplicationStatus, StatusSink};
use crate::flat_error::{CalibrationFailure, FlatError, check_cancel};
use crate::histogram_math::{ExposureAduState, get_exposure_adu_state, target_adu};

pub const MAX_ITERATIONS: u32 = 20;

// Exposure times closer than this (seconds) are considered equal.
pub const EXPOSURE_EPSILON: f64 = 0.00001;

/// A scalar that the bisection search can drive: panel brightness (i32) or
/// exposure time in seconds (f64).
pub trait ControlValue: Copy + PartialOrd + Debug + Display + Send + Sync + 'static {
    // Candidate halfway between `lo` and `hi`, rounded to the value's
    // resolution.
    fn bisect(lo: Self, hi: Self) -> Self;

    fn same_as(self, other: Self) -> bool;
}

impl ControlValue for i32 {
    fn bisect(lo: Self, hi: Self) -> Self {
        ((lo as f64 + hi as f64) / 2.0).round() as i32
    }

    fn same_as(self, other: Self) -> bool {
        self == other
    }
}

impl ControlValue for f64 {
    fn bisect(lo: Self, hi: Self) -> Self {
        round_exposure((lo + hi) / 2.0)
    }

    fn same_as(self, other: Self) -> bool {
        (self - other).abs() < EXPOSURE_EPSILON
    }
}

/// Rounds an exposure time (seconds) to 5 decimal places.
pub fn round_exposure(seconds: f64) -> f64 {
    (seconds * 100_000.0).round() / 100_000.0
}

/// Sets `candidate` on the equipment, captures a frame, and returns the
/// frame's mean ADU.
#[async_trait]
pub trait ExposureProbe<T: ControlValue> {
    async fn measure(&mut self, candidate: T, cancel: &AtomicBool)
                     -> Result<f64, FlatError>;
}

/// What a converged frame should look like.
#[derive(Clone, Copy, Debug)]
pub struct HistogramGoal {
    // Fraction of full-well, 0..1.
    pub target: f64,
    // Fraction of `target`, 0..1.
    pub tolerance: f64,
    pub bit_depth: u8,
}

impl HistogramGoal {
    pub fn classify(&self, mean_adu: f64) -> ExposureAduState {
        get_exposure_adu_state(mean_adu, self.target, self.bit_depth, self.tolerance)
    }

    pub fn target_adu(&self) -> f64 {
        target_adu(self.target, self.bit_depth)
    }
}

/// The bisection interval of one in-flight solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverState<T: ControlValue> {
    pub initial_min: T,
    pub initial_max: T,
    pub current_min: T,
    pub current_max: T,
    // Whether a frame was taken at `current_min` / `current_max`.
    pub min_measured: bool,
    pub max_measured: bool,
    pub iteration: u32,
}

impl<T: ControlValue> SolverState<T> {
    pub fn new(min: T, max: T) -> Self {
        SolverState{initial_min: min, initial_max: max,
                    current_min: min, current_max: max,
                    min_measured: false, max_measured: false, iteration: 0}
    }

    // Called when the iterations or the candidates are used up. If the search has been pushed
    // all the way to the top of the range, the light is too dim; otherwise it
    // is too bright. A zero-width range can't be judged that way, so there we
    // go by the last measurement.
    fn failure(&self, last_state: Option<ExposureAduState>) -> CalibrationFailure {
        if self.initial_min.same_as(self.initial_max) {
            return match last_state {
                Some(ExposureAduState::AboveUpperBound) => CalibrationFailure::TooBright,
                _ => CalibrationFailure::TooDim,
            };
        }
        if self.initial_max.same_as(self.current_min) {
            CalibrationFailure::TooDim
        } else {
            CalibrationFailure::TooBright
        }
    }

    // True if bisection can't produce a value strictly inside the current
    // interval.
    fn is_unsplittable(&self, candidate: T) -> bool {
        candidate.same_as(self.current_min) || candidate.same_as(self.current_max)
    }

    // Once the interval can't be split, the only values left are its ends.
    // Returns one that hasn't been measured yet, lower end first.
    fn unmeasured_endpoint(&self) -> Option<T> {
        let collapsed = self.current_min.same_as(self.current_max);
        let min_done = self.min_measured || (collapsed && self.max_measured);
        let max_done = self.max_measured || (collapsed && self.min_measured);
        if !min_done {
            Some(self.current_min)
        } else if !max_done {
            Some(self.current_max)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveOutcome<T> {
    pub value: T,
    // Mean ADU of the frame that landed within bounds.
    pub mean_adu: f64,
    // Number of frames measured.
    pub measurements: u32,
}

pub struct ExposureSolver<'a> {
    goal: HistogramGoal,
    status: &'a (dyn StatusSink + Send + Sync),
    // Status source label, e.g. the sequence item's name.
    source: String,
    // What is being solved, for status text: "exposure time", "brightness".
    quantity: &'static str,
}

impl<'a> ExposureSolver<'a> {
    pub fn new(goal: HistogramGoal,
               status: &'a (dyn StatusSink + Send + Sync),
               source: &str, quantity: &'static str) -> Self {
        ExposureSolver{goal, status, source: source.to_string(), quantity}
    }

    pub fn goal(&self) -> &HistogramGoal {
        &self.goal
    }

    /// Searches `min..=max` for a value whose frame mean ADU is within the
    /// goal's tolerance window. Gives up after MAX_ITERATIONS.
    pub async fn solve<T, P>(&self, min: T, max: T, probe: &mut P, cancel: &AtomicBool)
                             -> Result<SolveOutcome<T>, FlatError>
    where T: ControlValue, P: ExposureProbe<T> + Send + ?Sized
    {
        let mut state = SolverState::new(min, max);
        let mut last_state: Option<ExposureAduState> = None;
        let mut measurements = 0;
        info!("Determining flat {} within {}..{}, target {:.0} ADU +/- {:.0}%",
              self.quantity, min, max, self.goal.target_adu(),
              self.goal.tolerance * 100.0);
        loop {
            if state.iteration >= MAX_ITERATIONS {
                return Err(self.give_up(&state, last_state, measurements));
            }
            check_cancel(cancel, "flat exposure solve")?;

            let mut candidate = T::bisect(state.current_min, state.current_max);
            if state.is_unsplittable(candidate) {
                match state.unmeasured_endpoint() {
                    Some(endpoint) => {
                        debug!("Interval {}..{} can't be split; trying {}",
                               state.current_min, state.current_max, endpoint);
                        candidate = endpoint;
                    }
                    None => return Err(self.give_up(&state, last_state, measurements)),
                }
            }

            self.status.report(ApplicationStatus{
                status: format!("Determining flat {}: trying {}", self.quantity, candidate),
                progress: (state.iteration + 1) as f64,
                max_progress: MAX_ITERATIONS as f64,
                source: self.source.clone(),
            });

            let mean_adu = probe.measure(candidate, cancel).await?;
            measurements += 1;
            let adu_state = self.goal.classify(mean_adu);
            debug!("Flat {} {} gave mean {:.1} ADU: {:?}",
                   self.quantity, candidate, mean_adu, adu_state);
            last_state = Some(adu_state);
            match adu_state {
                ExposureAduState::WithinBounds => {
                    info!("Flat {} determined: {} (mean {:.1} ADU, {} frames)",
                          self.quantity, candidate, mean_adu, measurements);
                    return Ok(SolveOutcome{value: candidate, mean_adu, measurements});
                }
                ExposureAduState::BelowLowerBound => {
                    state.current_min = candidate;
                    state.min_measured = true;
                }
                ExposureAduState::AboveUpperBound => {
                    state.current_max = candidate;
                    state.max_measured = true;
                }
            }
            state.iteration += 1;
        }
    }

    fn give_up<T: ControlValue>(&self, state: &SolverState<T>,
                                last_state: Option<ExposureAduState>,
                                measurements: u32) -> FlatError {
        let failure = state.failure(last_state);
        warn!("Flat {} did not converge after {} frames: {}",
              self.quantity, measurements, failure);
        self.status.notify_warning(failure.to_string().as_str());
        FlatError::Convergence(failure)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[derive(Default)]
    struct RecordingStatus {
        reports: Mutex<Vec<ApplicationStatus>>,
        warnings: Mutex<Vec<String>>,
    }

    impl StatusSink for RecordingStatus {
        fn report(&self, status: ApplicationStatus) {
            self.reports.lock().unwrap().push(status);
        }
        fn notify_warning(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }
        fn clear(&self, _source: &str) {}
    }

    // Probe returning f(candidate), recording what it was asked.
    struct FnProbe<T, F: Fn(T) -> f64> {
        f: F,
        candidates: Vec<T>,
    }

    impl<T, F: Fn(T) -> f64> FnProbe<T, F> {
        fn new(f: F) -> Self {
            FnProbe{f, candidates: Vec::new()}
        }
    }

    #[async_trait]
    impl<T: ControlValue, F: Fn(T) -> f64 + Send> ExposureProbe<T> for FnProbe<T, F> {
        async fn measure(&mut self, candidate: T, _cancel: &AtomicBool)
                         -> Result<f64, FlatError> {
            self.candidates.push(candidate);
            Ok((self.f)(candidate))
        }
    }

    fn goal_16_bit(tolerance: f64) -> HistogramGoal {
        HistogramGoal{target: 0.5, tolerance, bit_depth: 16}
    }

    #[test]
    fn test_bisect_rounding() {
        assert_eq!(i32::bisect(0, 100), 50);
        assert_eq!(i32::bisect(37, 50), 44);
        assert_eq!(i32::bisect(41, 44), 43);
        assert_eq!(f64::bisect(0.0, 1.0), 0.5);
        assert_abs_diff_eq!(f64::bisect(0.0, 0.000033), 0.00002, epsilon = 1e-12);
        assert!(0.100001_f64.same_as(0.100005));
        assert!(!0.1_f64.same_as(0.10002));
    }

    #[tokio::test]
    async fn test_converges_to_exact_brightness() {
        let status = RecordingStatus::default();
        let goal = goal_16_bit(0.01);
        let target = goal.target_adu();
        let solver = ExposureSolver::new(goal, &status, "test", "brightness");
        // Mean ADU scales linearly with brightness; only 42 lands within 1%.
        let mut probe = FnProbe::new(|b: i32| target * b as f64 / 42.0);
        let cancel = AtomicBool::new(false);

        let outcome = solver.solve(0, 100, &mut probe, &cancel).await.unwrap();
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.mean_adu, target);
        assert_eq!(probe.candidates, vec![50, 25, 38, 44, 41, 43, 42]);
        assert_eq!(outcome.measurements, 7);

        let reports = status.reports.lock().unwrap();
        assert_eq!(reports.len(), 7);
        assert_eq!(reports[0].max_progress, MAX_ITERATIONS as f64);
        assert_eq!(reports[6].progress, 7.0);
        assert_eq!(reports[6].source, "test");
    }

    #[tokio::test]
    async fn test_converges_exposure_time() {
        let status = RecordingStatus::default();
        let goal = goal_16_bit(0.1);
        let solver = ExposureSolver::new(goal, &status, "test", "exposure time");
        // 12000 ADU per second.
        let mut probe = FnProbe::new(|t: f64| 12000.0 * t);
        let cancel = AtomicBool::new(false);

        let outcome = solver.solve(0.01, 10.0, &mut probe, &cancel).await.unwrap();
        assert_eq!(goal.classify(12000.0 * outcome.value), ExposureAduState::WithinBounds);
        assert!(outcome.measurements <= MAX_ITERATIONS);
        // Every candidate is rounded to 5 decimals.
        for c in probe.candidates {
            assert_abs_diff_eq!(c, round_exposure(c), epsilon = 1e-12);
        }
    }

    #[tokio::test]
    async fn test_monotonic_responses_converge_or_fail_correctly() {
        let cancel = AtomicBool::new(false);
        for gain in [1.0, 7.0, 50.0, 300.0, 655.35, 2000.0, 40000.0, 0.1] {
            let status = RecordingStatus::default();
            let goal = goal_16_bit(0.05);
            let solver = ExposureSolver::new(goal, &status, "test", "brightness");
            let f = move |b: i32| gain * b as f64;
            let mut probe = FnProbe::new(f);
            let result = solver.solve(0, 1000, &mut probe, &cancel).await;
            let reachable = (0..=1000).any(
                |b| goal.classify(f(b)) == ExposureAduState::WithinBounds);
            match result {
                Ok(outcome) => {
                    assert_eq!(goal.classify(f(outcome.value)),
                               ExposureAduState::WithinBounds);
                    assert!(outcome.measurements <= MAX_ITERATIONS);
                }
                Err(FlatError::Convergence(failure)) => {
                    assert!(probe.candidates.len() <= MAX_ITERATIONS as usize);
                    if f(1000) < goal.target_adu() {
                        assert_eq!(failure, CalibrationFailure::TooDim, "gain {}", gain);
                    } else if f(1) > goal.target_adu() {
                        assert_eq!(failure, CalibrationFailure::TooBright, "gain {}", gain);
                    } else {
                        // Target lies between two integer steps.
                        assert!(!reachable, "gain {}", gain);
                    }
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_too_dim() {
        let status = RecordingStatus::default();
        let solver = ExposureSolver::new(goal_16_bit(0.1), &status, "test", "brightness");
        let mut probe = FnProbe::new(|_b: i32| 100.0);
        let cancel = AtomicBool::new(false);

        let err = solver.solve(0, 100, &mut probe, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Convergence(CalibrationFailure::TooDim)));
        // Walks up to the top of the range, then gives up.
        assert_eq!(*probe.candidates.last().unwrap(), 100);
        assert!(probe.candidates.len() < MAX_ITERATIONS as usize);
        assert_eq!(status.warnings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_too_bright() {
        let status = RecordingStatus::default();
        let solver = ExposureSolver::new(goal_16_bit(0.1), &status, "test", "exposure time");
        let mut probe = FnProbe::new(|_t: f64| 65000.0);
        let cancel = AtomicBool::new(false);

        let err = solver.solve(0.01, 10.0, &mut probe, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Convergence(CalibrationFailure::TooBright)));
        assert!(probe.candidates.len() <= MAX_ITERATIONS as usize);
    }

    #[tokio::test]
    async fn test_only_lowest_brightness_within_bounds() {
        let status = RecordingStatus::default();
        let goal = goal_16_bit(0.01);
        let target = goal.target_adu();
        let solver = ExposureSolver::new(goal, &status, "test", "brightness");
        // Every step above 0 is far too bright.
        let mut probe = FnProbe::new(|b: i32| target + 10000.0 * b as f64);
        let cancel = AtomicBool::new(false);

        let outcome = solver.solve(0, 100, &mut probe, &cancel).await.unwrap();
        assert_eq!(outcome.value, 0);
        assert_eq!(probe.candidates, vec![50, 25, 13, 7, 4, 2, 1, 0]);
        assert!(status.warnings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_shortest_exposure_within_bounds() {
        let status = RecordingStatus::default();
        let goal = goal_16_bit(0.01);
        let target = goal.target_adu();
        let solver = ExposureSolver::new(goal, &status, "test", "exposure time");
        let mut probe = FnProbe::new(|t: f64| target * (1.0 + 10000.0 * (t - 0.01)));
        let cancel = AtomicBool::new(false);

        let outcome = solver.solve(0.01, 0.01004, &mut probe, &cancel).await.unwrap();
        assert_abs_diff_eq!(outcome.value, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(*probe.candidates.last().unwrap(), 0.01, epsilon = 1e-12);
        // The lower end is measured exactly once.
        assert_eq!(probe.candidates.iter().filter(|c| **c == 0.01).count(), 1);
    }

    #[tokio::test]
    async fn test_endpoints_measured_once() {
        let status = RecordingStatus::default();
        let goal = goal_16_bit(0.01);
        let target = goal.target_adu();
        let solver = ExposureSolver::new(goal, &status, "test", "brightness");
        // The target falls between brightness 41 and 42.
        let mut probe = FnProbe::new(|b: i32| target * b as f64 / 41.5);
        let cancel = AtomicBool::new(false);

        let err = solver.solve(0, 100, &mut probe, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Convergence(CalibrationFailure::TooBright)));
        let mut sorted = probe.candidates.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), probe.candidates.len());
        assert!(probe.candidates.contains(&41));
        assert!(probe.candidates.contains(&42));
    }

    #[tokio::test]
    async fn test_degenerate_bracket() {
        let status = RecordingStatus::default();
        let solver = ExposureSolver::new(goal_16_bit(0.1), &status, "test", "brightness");
        let cancel = AtomicBool::new(false);

        // min == max, within bounds: immediate success.
        let target = solver.goal().target_adu();
        let mut probe = FnProbe::new(|_b: i32| target);
        let outcome = solver.solve(50, 50, &mut probe, &cancel).await.unwrap();
        assert_eq!(outcome.value, 50);
        assert_eq!(probe.candidates, vec![50]);

        // min == max, far too dim.
        let mut probe = FnProbe::new(|_b: i32| 10.0);
        let err = solver.solve(50, 50, &mut probe, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Convergence(CalibrationFailure::TooDim)));
        assert!(probe.candidates.len() <= 2);

        // min == max, far too bright.
        let mut probe = FnProbe::new(|_b: i32| 65535.0);
        let err = solver.solve(50, 50, &mut probe, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Convergence(CalibrationFailure::TooBright)));
        assert!(probe.candidates.len() <= 2);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let status = RecordingStatus::default();
        let solver = ExposureSolver::new(goal_16_bit(0.1), &status, "test", "brightness");
        let mut probe = FnProbe::new(|_b: i32| 10.0);
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);

        let err = solver.solve(0, 100, &mut probe, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(probe.candidates.is_empty());
        assert!(status.warnings.lock().unwrap().is_empty());
    }

}  // mod tests.
