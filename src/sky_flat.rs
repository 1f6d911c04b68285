// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

use crate::astro_util::is_morning;
use crate::calibration_params::FlatExposureParams;
use crate::device_traits::{BinningMode, ExposureSpec, FilterInfo, ImageType};
use crate::exposure_solver::{ExposureSolver, HistogramGoal};
use crate::flat_error::{FlatError, check_cancel};
use crate::flat_sequence::{ExposureTimeProbe, FlatItemCore, FlatRig, FlatRun,
                           FlatRunOutcome, FlatRunState, FlatSteps, SharedGuider};
use crate::histogram_math::ExposureAduState;
use crate::twilight_model::{TwilightModel, twilight_ratio};

/// Where the twilight direction and rate come from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TwilightSource {
    // Computed from the sun's position at the observer (radians, east
    // positive) when the model is derived.
    Observer { latitude: f64, longitude: f64 },
    // Given directly.
    Fixed { morning: bool, tau: f64 },
}

impl TwilightSource {
    fn resolve(&self, now: SystemTime) -> (bool, f64) {
        match *self {
            TwilightSource::Observer{latitude, longitude} => {
                let morning = is_morning(latitude, longitude, now);
                (morning, twilight_ratio(latitude, longitude, now, morning))
            }
            TwilightSource::Fixed{morning, tau} => (morning, tau),
        }
    }
}

// Advances the model to a frame starting `ti + trot` seconds after the first,
// keeping the result within the allowed exposure range. None if the model
// can't follow the sky any more.
fn extrapolate_exposure(model: &mut TwilightModel, ti: f64, trot: f64,
                        params: &FlatExposureParams) -> Option<f64> {
    let t = model.advance(ti, trot)?;
    let min = params.min_exposure().as_secs_f64();
    let max = params.max_exposure().as_secs_f64();
    let clamped = t.clamp(min, max);
    if clamped != t {
        debug!("Extrapolated exposure {:.3}s clamped to {:.3}s", t, clamped);
    }
    Some(clamped)
}

// Dithers if the guider is able to; problems are logged and otherwise
// ignored.
async fn dither_between_frames(guider: Option<&SharedGuider>, cancel: &AtomicBool) {
    let guider = match guider {
        Some(guider) => guider,
        None => {
            debug!("No guider, not dithering");
            return;
        }
    };
    let mut locked_guider = guider.lock().await;
    let info = locked_guider.get_info();
    if !info.connected || !info.can_dither {
        info!("Guider not ready to dither (connected: {}), skipping", info.connected);
        return;
    }
    match locked_guider.dither(cancel).await {
        Ok(true) => debug!("Dither complete"),
        Ok(false) => info!("Guider declined to dither"),
        Err(e) => warn!("Dither failed: {}", e),
    }
}

/// Flats of the twilight sky. The exposure time is solved once, then
/// extrapolated frame to frame as the sky changes; when the extrapolation
/// drifts off target the exposure is solved again.
pub struct SkyFlat {
    pub core: FlatItemCore,
    pub params: FlatExposureParams,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    pub gain: i32,
    // Dither between frames (not after the last one).
    pub dither: bool,
    pub twilight: TwilightSource,
}

impl SkyFlat {
    pub fn new(iterations: u32, params: FlatExposureParams, filter: Option<FilterInfo>,
               twilight: TwilightSource) -> Self {
        SkyFlat{
            core: FlatItemCore::new("Sky flat", iterations),
            params,
            filter,
            binning: BinningMode::default(),
            gain: -1,
            dither: false,
            twilight,
        }
    }

    pub async fn validate(&mut self, rig: &FlatRig) -> bool {
        self.core.issues.clear();
        self.core.validate_camera(rig).await
    }

    pub async fn execute(&mut self, rig: &FlatRig, cancel: &AtomicBool)
                         -> Result<FlatRunOutcome, FlatError> {
        if self.core.is_complete() {
            info!("{}: all {} frames already taken", self.core.name, self.core.iterations);
            return Ok(FlatRunOutcome::AlreadyComplete);
        }
        self.core.determined_histogram_adu = 0.0;
        // Only the filter is touched; the telescope looks at the sky.
        let steps = FlatSteps{
            filter: self.filter.clone(),
            ..Default::default()
        };
        let mut run = FlatRun::new(rig, cancel, &self.core.name);
        let result = self.run_body(&mut run, &steps).await;
        run.restore_equipment(&steps).await;
        run.finish(result)
    }

    // Solves the exposure time afresh and builds a twilight model around it.
    async fn derive_model(&self, run: &mut FlatRun<'_>, goal: &HistogramGoal,
                          spec: &mut ExposureSpec) -> Result<TwilightModel, FlatError> {
        let rig = run.rig();
        let cancel = run.cancel_flag();
        run.transition(FlatRunState::Solving);
        let solver = ExposureSolver::new(*goal, rig.status.as_ref(), &self.core.name,
                                         "sky flat exposure time");
        let outcome = {
            let mut probe = ExposureTimeProbe{run: &mut *run, spec: spec.clone()};
            solver.solve(self.params.min_exposure().as_secs_f64(),
                         self.params.max_exposure().as_secs_f64(),
                         &mut probe, cancel).await?
        };
        spec.exposure_time = Duration::from_secs_f64(outcome.value);
        let (morning, tau) = self.twilight.resolve(SystemTime::now());
        info!("{} twilight model: first exposure {:.3}s, tau {:.3}",
              if morning { "Morning" } else { "Evening" }, outcome.value, tau);
        run.transition(FlatRunState::MainCapture);
        Ok(TwilightModel::new(outcome.value, tau, morning))
    }

    async fn drift_correction(&self, run: &mut FlatRun<'_>, goal: &HistogramGoal,
                              spec: &mut ExposureSpec, reason: &str)
                              -> Result<TwilightModel, FlatError> {
        let message = format!("Sky flat exposure drifted ({}); determining exposure again",
                              reason);
        warn!("{}", message);
        run.rig().status.notify_warning(&message);
        run.report_mut().drift_corrections += 1;
        self.derive_model(run, goal, spec).await
    }

    async fn run_body(&mut self, run: &mut FlatRun<'_>, steps: &FlatSteps)
                      -> Result<(), FlatError> {
        run.prepare_equipment(steps).await?;
        let rig = run.rig();
        let cancel = run.cancel_flag();
        let camera_info = rig.camera.lock().await.get_info();
        let goal = HistogramGoal{target: self.params.histogram_target(),
                                 tolerance: self.params.histogram_tolerance(),
                                 bit_depth: camera_info.bit_depth};
        let mut spec = ExposureSpec{
            exposure_time: self.params.min_exposure(),
            image_type: ImageType::Flat,
            filter: self.filter.clone(),
            binning: self.binning,
            gain: self.gain,
        };

        let mut model = self.derive_model(run, &goal, &mut spec).await?;
        run.report_mut().solved_exposure = Some(spec.exposure_time);
        // Started when the first frame of the current model begins exposing.
        let mut stopwatch: Option<Instant> = None;

        let iterations = self.core.iterations;
        while self.core.completed_iterations < iterations {
            check_cancel(cancel, "sky flat capture")?;
            let frame_number = self.core.completed_iterations + 1;
            run.post_status(format!("Capturing sky flat {}/{} ({:.3}s)", frame_number,
                                    iterations, spec.exposure_time.as_secs_f64()),
                            frame_number as f64, iterations as f64);

            let started = *stopwatch.get_or_insert_with(Instant::now);
            let raw = run.capture_raw(&spec).await?;
            let exposure_end = started.elapsed().as_secs_f64();

            // The guider moves the mount while the frame downloads.
            let dither_now = self.dither && frame_number < iterations;
            let dither = async {
                if dither_now {
                    dither_between_frames(rig.guider.as_ref(), cancel).await;
                }
            };
            let (image, ()) = futures::join!(run.prepare(raw), dither);
            let image = image?;

            let mean = image.statistics().mean;
            let adu_state = goal.classify(mean);
            if adu_state != ExposureAduState::WithinBounds {
                // Discard the frame and retry the same frame number.
                model = self.drift_correction(
                    run, &goal, &mut spec,
                    &format!("mean {:.0} ADU is {:?}", mean, adu_state)).await?;
                stopwatch = None;
                continue;
            }
            run.deliver_frame(image);
            self.core.completed_iterations += 1;
            self.core.determined_histogram_adu = mean;
            if self.core.completed_iterations >= iterations {
                break;
            }

            // ti: from the start of the model's first frame to the end of
            // this frame's exposure. trot: download, dither and bookkeeping
            // since then, i.e. until the next frame begins.
            let trot = started.elapsed().as_secs_f64() - exposure_end;
            match extrapolate_exposure(&mut model, exposure_end, trot, &self.params) {
                Some(t) => {
                    debug!("Next sky flat exposure {:.4}s (ti {:.2}s, trot {:.2}s)",
                           t, exposure_end, trot);
                    spec.exposure_time = Duration::from_secs_f64(t);
                }
                None => {
                    model = self.drift_correction(
                        run, &goal, &mut spec, "twilight model has no valid exposure").await?;
                    stopwatch = None;
                }
            }
        }
        Ok(())
    }
}

// mod tests.
