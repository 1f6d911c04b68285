// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Flat panel items that find their own exposure: AutoExposureFlat solves the
// exposure time at a fixed panel brightness, AutoBrightnessFlat solves the
// panel brightness at a fixed exposure time. Either way the result is
// remembered as a trained flat setting.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::calibration_params::{FlatBrightnessParams, FlatExposureParams};
use crate::device_traits::{BinningMode, ExposureSpec, FilterInfo, ImageType};
use crate::exposure_solver::{ExposureSolver, HistogramGoal};
use crate::flat_error::FlatError;
use crate::flat_sequence::{BrightnessProbe, ExposureTimeProbe, FlatItemCore, FlatRig,
                           FlatRun, FlatRunOutcome, FlatRunState, FlatSteps};
use crate::trained_flats::{TrainedFlatSetting, TrainedFlatStore, trained_flat_key};

// Stores the solved setting, unless the panel went away during the solve (in
// which case the frames may not have been lit by it).
async fn record_trained_setting(store: &(dyn TrainedFlatStore + Send + Sync),
                                rig: &FlatRig, filter: Option<&FilterInfo>,
                                binning: BinningMode, gain: i32,
                                setting: TrainedFlatSetting) {
    if !rig.flat_device_connected().await {
        info!("Flat panel not connected; not recording trained flat setting");
        return;
    }
    let camera_info = rig.camera.lock().await.get_info();
    store.put(trained_flat_key(filter, binning, gain, &camera_info), setting);
}

pub struct AutoExposureFlat {
    pub core: FlatItemCore,
    pub params: FlatExposureParams,
    // Panel brightness held while the exposure time is solved.
    pub brightness: i32,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    pub gain: i32,
    store: Arc<dyn TrainedFlatStore + Send + Sync>,
}

impl AutoExposureFlat {
    pub fn new(iterations: u32, params: FlatExposureParams, brightness: i32,
               filter: Option<FilterInfo>,
               store: Arc<dyn TrainedFlatStore + Send + Sync>) -> Self {
        AutoExposureFlat{
            core: FlatItemCore::new("Auto exposure flat", iterations),
            params,
            brightness,
            filter,
            binning: BinningMode::default(),
            gain: -1,
            store,
        }
    }

    // The panel is optional here: without one, the brightness step is
    // skipped and whatever light reaches the sensor is used.
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
        let steps = FlatSteps{
            close_cover: true,
            light: Some(true),
            filter: self.filter.clone(),
            brightness: Some(self.brightness),
            keep_panel_closed: self.params.keep_panel_closed(),
        };
        let mut run = FlatRun::new(rig, cancel, &self.core.name);
        let result = self.run_body(&mut run, &steps).await;
        run.restore_equipment(&steps).await;
        run.finish(result)
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

        run.transition(FlatRunState::Solving);
        let solver = ExposureSolver::new(goal, rig.status.as_ref(), &self.core.name,
                                         "exposure time");
        let outcome = {
            let mut probe = ExposureTimeProbe{run: &mut *run, spec: spec.clone()};
            solver.solve(self.params.min_exposure().as_secs_f64(),
                         self.params.max_exposure().as_secs_f64(),
                         &mut probe, cancel).await?
        };
        self.core.determined_histogram_adu = outcome.mean_adu;
        spec.exposure_time = Duration::from_secs_f64(outcome.value);
        run.report_mut().solved_exposure = Some(spec.exposure_time);
        run.report_mut().solved_brightness = Some(self.brightness);

        record_trained_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                               self.binning, self.gain,
                               TrainedFlatSetting{brightness: self.brightness,
                                                  exposure_time: outcome.value}).await;

        if let Some(mean) = run.capture_frames(&spec, self.core.iterations,
                                               &mut self.core.completed_iterations).await? {
            self.core.determined_histogram_adu = mean;
        }
        Ok(())
    }
}

pub struct AutoBrightnessFlat {
    pub core: FlatItemCore,
    pub params: FlatBrightnessParams,
    // Exposure time held while the brightness is solved.
    pub exposure_time: Duration,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    pub gain: i32,
    store: Arc<dyn TrainedFlatStore + Send + Sync>,
}

impl AutoBrightnessFlat {
    pub fn new(iterations: u32, params: FlatBrightnessParams, exposure_time: Duration,
               filter: Option<FilterInfo>,
               store: Arc<dyn TrainedFlatStore + Send + Sync>) -> Self {
        AutoBrightnessFlat{
            core: FlatItemCore::new("Auto brightness flat", iterations),
            params,
            exposure_time,
            filter,
            binning: BinningMode::default(),
            gain: -1,
            store,
        }
    }

    pub async fn validate(&mut self, rig: &FlatRig) -> bool {
        self.core.issues.clear();
        if !self.core.validate_camera(rig).await {
            return false;
        }
        if !rig.flat_device_connected().await {
            self.core.issues.push("Flat panel is not connected".to_string());
        }
        self.core.issues.is_empty()
    }

    pub async fn execute(&mut self, rig: &FlatRig, cancel: &AtomicBool)
                         -> Result<FlatRunOutcome, FlatError> {
        if self.core.is_complete() {
            info!("{}: all {} frames already taken", self.core.name, self.core.iterations);
            return Ok(FlatRunOutcome::AlreadyComplete);
        }
        self.core.determined_histogram_adu = 0.0;
        let steps = FlatSteps{
            close_cover: true,
            light: Some(true),
            filter: self.filter.clone(),
            brightness: None,
            keep_panel_closed: self.params.keep_panel_closed(),
        };
        let mut run = FlatRun::new(rig, cancel, &self.core.name);
        let result = self.run_body(&mut run, &steps).await;
        run.restore_equipment(&steps).await;
        run.finish(result)
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
        let spec = ExposureSpec{
            exposure_time: self.exposure_time,
            image_type: ImageType::Flat,
            filter: self.filter.clone(),
            binning: self.binning,
            gain: self.gain,
        };

        run.transition(FlatRunState::Solving);
        let solver = ExposureSolver::new(goal, rig.status.as_ref(), &self.core.name,
                                         "brightness");
        // The panel is left at the converged brightness for the main capture.
        let outcome = {
            let mut probe = BrightnessProbe{run: &mut *run, spec: spec.clone()};
            solver.solve(self.params.min_brightness(), self.params.max_brightness(),
                         &mut probe, cancel).await?
        };
        self.core.determined_histogram_adu = outcome.mean_adu;
        run.report_mut().solved_brightness = Some(outcome.value);
        run.report_mut().solved_exposure = Some(self.exposure_time);

        record_trained_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                               self.binning, self.gain,
                               TrainedFlatSetting{
                                   brightness: outcome.value,
                                   exposure_time: self.exposure_time.as_secs_f64()}).await;

        if let Some(mean) = run.capture_frames(&spec, self.core.iterations,
                                               &mut self.core.completed_iterations).await? {
            self.core.determined_histogram_adu = mean;
        }
        Ok(())
    }
}

// mod tests.
