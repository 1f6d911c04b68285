// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Shared machinery for the flat sequence items: the equipment bundle, the
// per-run state machine, and the individual hardware steps (cover, light,
// filter, brightness, capture) each of which is validated before being
// issued and skipped when the equipment can't do it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::failed_precondition_error;
use log::{debug, info, warn};

use crate::device_traits::{ApplicationStatus, ExposureSpec, FilterInfo, FilterWheel,
                           FlatCamera, FlatDevice, FrameSaver, Guider, PrepareParams,
                           RawExposure, RenderedImage, StatusSink};
use crate::exposure_solver::ExposureProbe;
use crate::flat_error::{FlatError, check_cancel, device_error};
use crate::value_stats::{AduStatsAccumulator, DescriptiveStats};

// Pause after a run (success or failure) before the status line is cleared,
// so that the last message stays readable.
pub const DRAIN_DELAY: Duration = Duration::from_millis(500);

pub type SharedCamera = Arc<tokio::sync::Mutex<dyn FlatCamera + Send>>;
pub type SharedFlatDevice = Arc<tokio::sync::Mutex<dyn FlatDevice + Send>>;
pub type SharedFilterWheel = Arc<tokio::sync::Mutex<dyn FilterWheel + Send>>;
pub type SharedGuider = Arc<tokio::sync::Mutex<dyn Guider + Send>>;

/// The equipment and services a flat item works with.
#[derive(Clone)]
pub struct FlatRig {
    pub camera: SharedCamera,
    pub flat_device: Option<SharedFlatDevice>,
    pub filter_wheel: Option<SharedFilterWheel>,
    pub guider: Option<SharedGuider>,
    pub status: Arc<dyn StatusSink + Send + Sync>,
    pub frame_saver: Arc<dyn FrameSaver + Send + Sync>,
}

impl FlatRig {
    pub async fn flat_device_connected(&self) -> bool {
        match &self.flat_device {
            Some(device) => device.lock().await.get_info().connected,
            None => false,
        }
    }
}

/// Parent container of a flat item. Interrupts raised inside a flat item are
/// handed to the parent, since the item is one calibration unit.
pub trait SequenceParent {
    fn interrupt(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlatRunState {
    Idle,
    ClosingCover,
    SettingLight,
    SwitchingFilter,
    Solving,
    MainCapture,
    RestoringLight,
    OpeningCover,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    CloseCover,
    ToggleLight,
    SwitchFilter,
    SetBrightness,
    OpenCover,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    // The item was not given a device of this kind.
    NoDevice,
    Disconnected,
    // The device lacks the capability (no motorized cover, no on/off switch).
    Unsupported,
    KeepPanelClosed,
    // The step has no work to do, e.g. no filter was requested.
    NotRequested,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NoDevice => "no device",
            SkipReason::Disconnected => "device not connected",
            SkipReason::Unsupported => "not supported by device",
            SkipReason::KeepPanelClosed => "panel is kept closed",
            SkipReason::NotRequested => "not requested",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    Skipped(SkipReason),
}

/// What happened during a flat run.
#[derive(Clone, Debug)]
pub struct FlatRunReport {
    pub states: Vec<FlatRunState>,
    pub steps: Vec<(StepKind, StepOutcome)>,
    pub solved_brightness: Option<i32>,
    pub solved_exposure: Option<Duration>,
    // Frames delivered to the frame saver (excludes solver frames).
    pub frames_captured: u32,
    // Sky flats only: how many times the twilight model was re-derived.
    pub drift_corrections: u32,
    // Mean ADU of the delivered frames.
    pub adu_stats: DescriptiveStats,
    // Same, over the last few frames only; a spread here that the whole run
    // doesn't show points at the light changing late in the run.
    pub recent_adu_stats: DescriptiveStats,
}

impl FlatRunReport {
    fn new() -> Self {
        FlatRunReport{
            states: vec![FlatRunState::Idle],
            steps: Vec::new(),
            solved_brightness: None,
            solved_exposure: None,
            frames_captured: 0,
            drift_corrections: 0,
            adu_stats: DescriptiveStats::default(),
            recent_adu_stats: DescriptiveStats::default(),
        }
    }

    pub fn final_state(&self) -> FlatRunState {
        *self.states.last().unwrap_or(&FlatRunState::Idle)
    }

    pub fn step_outcome(&self, kind: StepKind) -> Option<StepOutcome> {
        self.steps.iter().rev().find(|(k, _)| *k == kind).map(|(_, o)| *o)
    }
}

#[derive(Clone, Debug)]
pub enum FlatRunOutcome {
    // `completed_iterations` already reached `iterations`; nothing was done.
    AlreadyComplete,
    Completed(FlatRunReport),
}

impl FlatRunOutcome {
    pub fn report(&self) -> Option<&FlatRunReport> {
        match self {
            FlatRunOutcome::AlreadyComplete => None,
            FlatRunOutcome::Completed(report) => Some(report),
        }
    }
}

/// The equipment preparation a flat item asks for, in execution order. The
/// restoration after the run mirrors it.
#[derive(Clone, Debug, Default)]
pub struct FlatSteps {
    pub close_cover: bool,
    // Light state while capturing; None leaves the light alone.
    pub light: Option<bool>,
    pub filter: Option<FilterInfo>,
    // Fixed panel brightness; None when brightness is solved or unused.
    pub brightness: Option<i32>,
    // Leave the cover closed after the run.
    pub keep_panel_closed: bool,
}

/// Loop bookkeeping, status and parent linkage common to the flat items.
pub struct FlatItemCore {
    pub name: String,
    pub iterations: u32,
    pub completed_iterations: u32,

    // Mean ADU of the most recent converged (or captured) frame. Reset to 0
    // at the start of each run.
    pub determined_histogram_adu: f64,

    // Populated by validate().
    pub issues: Vec<String>,

    parent: Option<Arc<dyn SequenceParent + Send + Sync>>,
}

impl FlatItemCore {
    pub fn new(name: &str, iterations: u32) -> Self {
        FlatItemCore{
            name: name.to_string(),
            iterations,
            completed_iterations: 0,
            determined_histogram_adu: 0.0,
            issues: Vec::new(),
            parent: None,
        }
    }

    pub fn attach_parent(&mut self, parent: Arc<dyn SequenceParent + Send + Sync>) {
        self.parent = Some(parent);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_iterations >= self.iterations
    }

    /// Forwards the interrupt to the parent container. Without a parent the
    /// run's own cancel flag is raised.
    pub fn interrupt(&self, cancel: &AtomicBool) {
        match &self.parent {
            Some(parent) => {
                info!("{}: forwarding interrupt to parent", self.name);
                parent.interrupt();
            }
            None => cancel.store(true, Ordering::Relaxed),
        }
    }

    /// Resets the loop so the item can be run again.
    pub fn reset_progress(&mut self) {
        self.completed_iterations = 0;
        self.determined_histogram_adu = 0.0;
    }

    // Checks shared by all flat items. Returns false if an issue was added.
    pub async fn validate_camera(&mut self, rig: &FlatRig) -> bool {
        if !rig.camera.lock().await.get_info().connected {
            self.issues.push("Camera is not connected".to_string());
            return false;
        }
        true
    }
}

/// One execution of a flat item. Tracks the state machine, issues the
/// hardware steps, and collects the report.
pub struct FlatRun<'a> {
    rig: &'a FlatRig,
    cancel: &'a AtomicBool,
    source: String,
    state: FlatRunState,
    adu_stats: AduStatsAccumulator,
    report: FlatRunReport,
}

impl<'a> FlatRun<'a> {
    pub fn new(rig: &'a FlatRig, cancel: &'a AtomicBool, source: &str) -> Self {
        FlatRun{
            rig,
            cancel,
            source: source.to_string(),
            state: FlatRunState::Idle,
            adu_stats: AduStatsAccumulator::new(5),
            report: FlatRunReport::new(),
        }
    }

    pub fn rig(&self) -> &'a FlatRig {
        self.rig
    }

    pub fn cancel_flag(&self) -> &'a AtomicBool {
        self.cancel
    }

    pub fn report_mut(&mut self) -> &mut FlatRunReport {
        &mut self.report
    }

    pub fn transition(&mut self, state: FlatRunState) {
        if state != self.state {
            debug!("{}: {:?} -> {:?}", self.source, self.state, state);
            self.state = state;
            self.report.states.push(state);
        }
    }

    pub fn post_status(&self, status: String, progress: f64, max_progress: f64) {
        self.rig.status.report(ApplicationStatus{
            status, progress, max_progress, source: self.source.clone()});
    }

    fn record_step(&mut self, kind: StepKind, outcome: StepOutcome) {
        if let StepOutcome::Skipped(reason) = outcome {
            info!("{}: skipping {:?}: {}", self.source, kind, reason);
        }
        self.report.steps.push((kind, outcome));
    }

    // Validation common to the flat device steps. Returns the device if the
    // step can go ahead.
    async fn usable_flat_device(&self, needs_open_close: bool, needs_on_off: bool)
                                -> Result<&'a SharedFlatDevice, SkipReason> {
        let rig: &'a FlatRig = self.rig;
        let device = match &rig.flat_device {
            Some(device) => device,
            None => return Err(SkipReason::NoDevice),
        };
        let info = device.lock().await.get_info();
        if !info.connected {
            return Err(SkipReason::Disconnected);
        }
        if (needs_open_close && !info.supports_open_close) ||
            (needs_on_off && !info.supports_on_off)
        {
            return Err(SkipReason::Unsupported);
        }
        Ok(device)
    }

    pub async fn close_cover(&mut self) -> Result<StepOutcome, FlatError> {
        self.transition(FlatRunState::ClosingCover);
        check_cancel(self.cancel, "close cover")?;
        let outcome = match self.usable_flat_device(true, false).await {
            Err(reason) => StepOutcome::Skipped(reason),
            Ok(device) => {
                self.post_status("Closing flat panel cover".to_string(), 0.0, 0.0);
                let cancel = self.cancel;
                device.lock().await.close_cover(cancel).await
                    .map_err(|e| device_error(e, cancel, "close cover"))?;
                StepOutcome::Executed
            }
        };
        self.record_step(StepKind::CloseCover, outcome);
        check_cancel(self.cancel, "close cover")?;
        Ok(outcome)
    }

    pub async fn set_light(&mut self, on: bool) -> Result<StepOutcome, FlatError> {
        self.transition(FlatRunState::SettingLight);
        check_cancel(self.cancel, "toggle light")?;
        let outcome = self.toggle_light(on).await?;
        check_cancel(self.cancel, "toggle light")?;
        Ok(outcome)
    }

    async fn toggle_light(&mut self, on: bool) -> Result<StepOutcome, FlatError> {
        let outcome = match self.usable_flat_device(false, true).await {
            Err(reason) => StepOutcome::Skipped(reason),
            Ok(device) => {
                self.post_status(format!("Turning flat panel light {}",
                                         if on { "on" } else { "off" }), 0.0, 0.0);
                let cancel = self.cancel;
                device.lock().await.toggle_light(on, cancel).await
                    .map_err(|e| device_error(e, cancel, "toggle light"))?;
                StepOutcome::Executed
            }
        };
        self.record_step(StepKind::ToggleLight, outcome);
        Ok(outcome)
    }

    // Returns the filter that ended up selected, if any.
    pub async fn switch_filter(&mut self, filter: Option<&FilterInfo>)
                               -> Result<Option<FilterInfo>, FlatError> {
        self.transition(FlatRunState::SwitchingFilter);
        check_cancel(self.cancel, "switch filter")?;
        let filter = match filter {
            Some(filter) => filter,
            None => {
                self.record_step(StepKind::SwitchFilter,
                                 StepOutcome::Skipped(SkipReason::NotRequested));
                return Ok(None);
            }
        };
        let rig: &'a FlatRig = self.rig;
        let wheel = match &rig.filter_wheel {
            Some(wheel) => wheel,
            None => {
                self.record_step(StepKind::SwitchFilter,
                                 StepOutcome::Skipped(SkipReason::NoDevice));
                return Ok(None);
            }
        };
        let mut locked_wheel = wheel.lock().await;
        if !locked_wheel.get_info().connected {
            drop(locked_wheel);
            self.record_step(StepKind::SwitchFilter,
                             StepOutcome::Skipped(SkipReason::Disconnected));
            return Ok(None);
        }
        self.post_status(format!("Switching to filter {}", filter.name), 0.0, 0.0);
        let cancel = self.cancel;
        let selected = locked_wheel.switch_filter(filter, cancel).await
            .map_err(|e| device_error(e, cancel, "switch filter"))?;
        drop(locked_wheel);
        check_cancel(cancel, "switch filter")?;
        info!("{}: filter {} selected (position {})",
              self.source, selected.name, selected.position);
        self.record_step(StepKind::SwitchFilter, StepOutcome::Executed);
        Ok(Some(selected))
    }

    // The brightness step of the step list: skipped if the panel can't take
    // it.
    pub async fn set_brightness(&mut self, brightness: i32) -> Result<StepOutcome, FlatError> {
        check_cancel(self.cancel, "set brightness")?;
        let outcome = match self.usable_flat_device(false, false).await {
            Err(reason) => StepOutcome::Skipped(reason),
            Ok(device) => {
                self.post_status(format!("Setting flat panel brightness to {}", brightness),
                                 0.0, 0.0);
                let cancel = self.cancel;
                device.lock().await.set_brightness(brightness, cancel).await
                    .map_err(|e| device_error(e, cancel, "set brightness"))?;
                StepOutcome::Executed
            }
        };
        self.record_step(StepKind::SetBrightness, outcome);
        check_cancel(self.cancel, "set brightness")?;
        Ok(outcome)
    }

    // Brightness changes the solver depends on. Unlike set_brightness(), a
    // missing panel is an error here.
    pub async fn apply_brightness(&mut self, brightness: i32) -> Result<(), FlatError> {
        check_cancel(self.cancel, "set brightness")?;
        match self.usable_flat_device(false, false).await {
            Ok(device) => {
                let cancel = self.cancel;
                device.lock().await.set_brightness(brightness, cancel).await
                    .map_err(|e| device_error(e, cancel, "set brightness"))?;
                check_cancel(cancel, "set brightness")
            }
            Err(reason) => Err(FlatError::Device(failed_precondition_error(
                format!("Cannot set flat panel brightness: {}", reason).as_str()))),
        }
    }

    pub async fn open_cover(&mut self, keep_panel_closed: bool) -> Result<StepOutcome, FlatError> {
        self.transition(FlatRunState::OpeningCover);
        let outcome = if keep_panel_closed {
            StepOutcome::Skipped(SkipReason::KeepPanelClosed)
        } else {
            match self.usable_flat_device(true, false).await {
                Err(reason) => StepOutcome::Skipped(reason),
                Ok(device) => {
                    self.post_status("Opening flat panel cover".to_string(), 0.0, 0.0);
                    let cancel = self.cancel;
                    device.lock().await.open_cover(cancel).await
                        .map_err(|e| device_error(e, cancel, "open cover"))?;
                    StepOutcome::Executed
                }
            }
        };
        self.record_step(StepKind::OpenCover, outcome);
        Ok(outcome)
    }

    /// Exposes a frame; returns once the integration has ended.
    pub async fn capture_raw(&mut self, spec: &ExposureSpec) -> Result<RawExposure, FlatError> {
        let cancel = self.cancel;
        check_cancel(cancel, "flat capture")?;
        let raw = self.rig.camera.lock().await.capture_image(spec, cancel).await
            .map_err(|e| device_error(e, cancel, "flat capture"))?;
        check_cancel(cancel, "flat capture")?;
        Ok(raw)
    }

    /// Downloads and prepares a captured frame.
    pub async fn prepare(&mut self, raw: RawExposure) -> Result<RenderedImage, FlatError> {
        let cancel = self.cancel;
        check_cancel(cancel, "flat download")?;
        let image = self.rig.camera.lock().await.prepare_image(
            raw, &PrepareParams::default(), cancel).await
            .map_err(|e| device_error(e, cancel, "flat download"))?;
        check_cancel(cancel, "flat download")?;
        Ok(image)
    }

    pub async fn capture(&mut self, spec: &ExposureSpec) -> Result<RenderedImage, FlatError> {
        let raw = self.capture_raw(spec).await?;
        self.prepare(raw).await
    }

    /// Hands a frame to the saver and folds it into the run's statistics.
    pub fn deliver_frame(&mut self, image: RenderedImage) -> f64 {
        let mean = image.statistics().mean;
        self.adu_stats.add_value(mean);
        self.report.frames_captured += 1;
        self.rig.frame_saver.enqueue(image);
        mean
    }

    /// The main exposure loop: captures frames until `completed` reaches
    /// `iterations`. Returns the mean ADU of the last frame.
    pub async fn capture_frames(&mut self, spec: &ExposureSpec,
                                iterations: u32, completed: &mut u32)
                                -> Result<Option<f64>, FlatError> {
        self.transition(FlatRunState::MainCapture);
        let mut last_mean = None;
        while *completed < iterations {
            self.post_status(format!("Capturing {:?} frame {}/{} ({:.3}s)",
                                     spec.image_type, *completed + 1, iterations,
                                     spec.exposure_time.as_secs_f64()),
                             (*completed + 1) as f64, iterations as f64);
            let image = self.capture(spec).await?;
            last_mean = Some(self.deliver_frame(image));
            *completed += 1;
        }
        Ok(last_mean)
    }

    /// Post-run restoration. Always runs the drain delay and clears the
    /// status; device errors are logged, not returned.
    pub async fn teardown(&mut self, light_off: bool, open_cover: bool, keep_panel_closed: bool) {
        if light_off {
            self.transition(FlatRunState::RestoringLight);
            if let Err(e) = self.toggle_light(false).await {
                warn!("{}: could not turn flat panel light off: {}", self.source, e);
            }
        }
        if open_cover {
            if let Err(e) = self.open_cover(keep_panel_closed).await {
                warn!("{}: could not open flat panel cover: {}", self.source, e);
            }
        }
        tokio::time::sleep(DRAIN_DELAY).await;
        self.rig.status.clear(&self.source);
    }

    /// Runs the preparation steps. Returns the filter that ended up
    /// selected, if any.
    pub async fn prepare_equipment(&mut self, steps: &FlatSteps)
                                   -> Result<Option<FilterInfo>, FlatError> {
        if steps.close_cover {
            self.close_cover().await?;
        }
        if let Some(on) = steps.light {
            self.set_light(on).await?;
        }
        let selected = self.switch_filter(steps.filter.as_ref()).await?;
        if let Some(brightness) = steps.brightness {
            self.set_brightness(brightness).await?;
        }
        Ok(selected)
    }

    /// Undoes prepare_equipment(): light off if it was turned on, cover
    /// reopened if it was closed.
    pub async fn restore_equipment(&mut self, steps: &FlatSteps) {
        self.teardown(steps.light == Some(true), steps.close_cover,
                      steps.keep_panel_closed).await;
    }

    /// Ends the run, converting the body's result into the item's result.
    pub fn finish(mut self, result: Result<(), FlatError>)
                  -> Result<FlatRunOutcome, FlatError> {
        self.report.adu_stats = self.adu_stats.session.clone();
        self.report.recent_adu_stats = self.adu_stats.recent.clone();
        match result {
            Ok(()) => {
                self.transition(FlatRunState::Done);
                info!("{}: done, {} frames captured",
                      self.source, self.report.frames_captured);
                Ok(FlatRunOutcome::Completed(self.report))
            }
            Err(e) => {
                self.transition(FlatRunState::Failed);
                match &e {
                    FlatError::Cancelled(_) => info!("{}: {}", self.source, e),
                    // The solver has already told the user.
                    FlatError::Convergence(_) => warn!("{}: {}", self.source, e),
                    _ => {
                        warn!("{}: {}", self.source, e);
                        self.rig.status.notify_warning(e.to_string().as_str());
                    }
                }
                Err(e)
            }
        }
    }
}

/// Probe for solving exposure time: each candidate (seconds) is captured
/// with the rest of `spec` unchanged.
pub struct ExposureTimeProbe<'r, 'a> {
    pub run: &'r mut FlatRun<'a>,
    pub spec: ExposureSpec,
}

#[async_trait]
impl<'r, 'a> ExposureProbe<f64> for ExposureTimeProbe<'r, 'a> {
    async fn measure(&mut self, candidate: f64, _cancel: &AtomicBool)
                     -> Result<f64, FlatError> {
        self.spec.exposure_time = Duration::from_secs_f64(candidate);
        let image = self.run.capture(&self.spec).await?;
        Ok(image.statistics().mean)
    }
}

/// Probe for solving panel brightness at the exposure time in `spec`.
pub struct BrightnessProbe<'r, 'a> {
    pub run: &'r mut FlatRun<'a>,
    pub spec: ExposureSpec,
}

#[async_trait]
impl<'r, 'a> ExposureProbe<i32> for BrightnessProbe<'r, 'a> {
    async fn measure(&mut self, candidate: i32, _cancel: &AtomicBool)
                     -> Result<f64, FlatError> {
        self.run.apply_brightness(candidate).await?;
        let image = self.run.capture(&self.spec).await?;
        Ok(image.statistics().mean)
    }
}
