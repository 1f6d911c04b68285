// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Flat settings remembered from earlier auto flat runs, and the sequence
// items that replay them without solving.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::device_traits::{BinningMode, CameraInfo, ExposureSpec, FilterInfo, ImageType};
use crate::flat_error::FlatError;
use crate::flat_sequence::{FlatItemCore, FlatRig, FlatRun, FlatRunOutcome, FlatSteps};

/// Identifies the optical configuration a flat setting applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrainedFlatKey {
    // None when no filter wheel is in use.
    pub filter_position: Option<u16>,
    pub binning: BinningMode,
    // Never -1; the camera default is substituted.
    pub gain: i32,
}

impl fmt::Display for TrainedFlatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filter_position {
            Some(position) => write!(f, "filter position {}", position)?,
            None => write!(f, "no filter")?,
        }
        write!(f, ", binning {}, gain {}", self.binning, self.gain)
    }
}

/// Builds the lookup key, resolving gain -1 to the camera's default gain.
pub fn trained_flat_key(filter: Option<&FilterInfo>, binning: BinningMode, gain: i32,
                        camera_info: &CameraInfo) -> TrainedFlatKey {
    TrainedFlatKey{
        filter_position: filter.map(|f| f.position),
        binning,
        gain: if gain == -1 { camera_info.default_gain } else { gain },
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainedFlatSetting {
    pub brightness: i32,
    // Seconds.
    pub exposure_time: f64,
}

/// Persistence of trained flat settings. put() replaces any existing entry.
pub trait TrainedFlatStore {
    fn get(&self, key: &TrainedFlatKey) -> Option<TrainedFlatSetting>;
    fn put(&self, key: TrainedFlatKey, setting: TrainedFlatSetting);
}

#[derive(Default)]
pub struct InMemoryTrainedFlatStore {
    settings: Mutex<HashMap<TrainedFlatKey, TrainedFlatSetting>>,
}

impl InMemoryTrainedFlatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.settings.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrainedFlatStore for InMemoryTrainedFlatStore {
    fn get(&self, key: &TrainedFlatKey) -> Option<TrainedFlatSetting> {
        self.settings.lock().unwrap().get(key).copied()
    }

    fn put(&self, key: TrainedFlatKey, setting: TrainedFlatSetting) {
        info!("Recording trained flat for {}: brightness {}, exposure {:.5}s",
              key, setting.brightness, setting.exposure_time);
        self.settings.lock().unwrap().insert(key, setting);
    }
}

// Shared by the two trained items: looks up the setting for the item's
// configuration.
async fn lookup_setting(store: &(dyn TrainedFlatStore + Send + Sync), rig: &FlatRig,
                        filter: Option<&FilterInfo>, binning: BinningMode, gain: i32)
                        -> Result<TrainedFlatSetting, FlatError> {
    let camera_info = rig.camera.lock().await.get_info();
    let key = trained_flat_key(filter, binning, gain, &camera_info);
    store.get(&key).ok_or(FlatError::TrainedSettingNotFound(key))
}

/// Captures flats using the brightness and exposure time recorded for the
/// current filter, binning and gain.
pub struct TrainedFlatExposure {
    pub core: FlatItemCore,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    pub gain: i32,
    pub keep_panel_closed: bool,
    store: Arc<dyn TrainedFlatStore + Send + Sync>,
}

impl TrainedFlatExposure {
    pub fn new(iterations: u32, filter: Option<FilterInfo>,
               store: Arc<dyn TrainedFlatStore + Send + Sync>) -> Self {
        TrainedFlatExposure{
            core: FlatItemCore::new("Trained flat exposure", iterations),
            filter,
            binning: BinningMode::default(),
            gain: -1,
            keep_panel_closed: false,
            store,
        }
    }

    pub async fn validate(&mut self, rig: &FlatRig) -> bool {
        self.core.issues.clear();
        if !self.core.validate_camera(rig).await {
            return false;
        }
        if let Err(e) = lookup_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                                       self.binning, self.gain).await {
            self.core.issues.push(e.to_string());
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
        let setting = lookup_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                                     self.binning, self.gain).await?;
        let steps = FlatSteps{
            close_cover: true,
            light: Some(true),
            filter: self.filter.clone(),
            brightness: Some(setting.brightness),
            keep_panel_closed: self.keep_panel_closed,
        };
        let mut run = FlatRun::new(rig, cancel, &self.core.name);
        let result = self.run_body(&mut run, &steps, setting).await;
        run.restore_equipment(&steps).await;
        run.finish(result)
    }

    async fn run_body(&mut self, run: &mut FlatRun<'_>, steps: &FlatSteps,
                      setting: TrainedFlatSetting) -> Result<(), FlatError> {
        run.prepare_equipment(steps).await?;
        let spec = ExposureSpec{
            exposure_time: Duration::from_secs_f64(setting.exposure_time),
            image_type: ImageType::Flat,
            filter: self.filter.clone(),
            binning: self.binning,
            gain: self.gain,
        };
        run.report_mut().solved_brightness = Some(setting.brightness);
        run.report_mut().solved_exposure = Some(spec.exposure_time);
        if let Some(mean) = run.capture_frames(&spec, self.core.iterations,
                                               &mut self.core.completed_iterations).await? {
            self.core.determined_histogram_adu = mean;
        }
        Ok(())
    }
}

/// Captures dark flats: cover closed, light off, at the exposure time
/// recorded for the current filter, binning and gain.
pub struct TrainedDarkFlatExposure {
    pub core: FlatItemCore,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    pub gain: i32,
    pub keep_panel_closed: bool,
    store: Arc<dyn TrainedFlatStore + Send + Sync>,
}

impl TrainedDarkFlatExposure {
    pub fn new(iterations: u32, filter: Option<FilterInfo>,
               store: Arc<dyn TrainedFlatStore + Send + Sync>) -> Self {
        TrainedDarkFlatExposure{
            core: FlatItemCore::new("Trained dark flat exposure", iterations),
            filter,
            binning: BinningMode::default(),
            gain: -1,
            keep_panel_closed: false,
            store,
        }
    }

    pub async fn validate(&mut self, rig: &FlatRig) -> bool {
        self.core.issues.clear();
        if !self.core.validate_camera(rig).await {
            return false;
        }
        if let Err(e) = lookup_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                                       self.binning, self.gain).await {
            self.core.issues.push(e.to_string());
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
        let setting = lookup_setting(self.store.as_ref(), rig, self.filter.as_ref(),
                                     self.binning, self.gain).await?;
        // The filter still matters: dark flats match the flats' exposure, and
        // some filters leak.
        let steps = FlatSteps{
            close_cover: true,
            light: Some(false),
            filter: self.filter.clone(),
            brightness: None,
            keep_panel_closed: self.keep_panel_closed,
        };
        let mut run = FlatRun::new(rig, cancel, &self.core.name);
        let result = self.run_body(&mut run, &steps, setting).await;
        run.restore_equipment(&steps).await;
        run.finish(result)
    }

    async fn run_body(&mut self, run: &mut FlatRun<'_>, steps: &FlatSteps,
                      setting: TrainedFlatSetting) -> Result<(), FlatError> {
        run.prepare_equipment(steps).await?;
        let spec = ExposureSpec{
            exposure_time: Duration::from_secs_f64(setting.exposure_time),
            image_type: ImageType::DarkFlat,
            filter: self.filter.clone(),
            binning: self.binning,
            gain: self.gain,
        };
        run.report_mut().solved_exposure = Some(spec.exposure_time);
        if let Some(mean) = run.capture_frames(&spec, self.core.iterations,
                                               &mut self.core.completed_iterations).await? {
            self.core.determined_histogram_adu = mean;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use crate::flat_sequence::{FlatRunState, SequenceParent, SkipReason, StepKind,
                               StepOutcome, SharedCamera, SharedFlatDevice,
                               SharedFilterWheel};
    use crate::simulated_rig::{CollectingFrameSaver, RecordingStatus, SimCamera,
                               SimFilterWheel, SimFlatPanel, SimScene};
    use super::*;

    struct Bench {
        scene: Arc<SimScene>,
        camera: Arc<tokio::sync::Mutex<SimCamera>>,
        panel: Arc<tokio::sync::Mutex<SimFlatPanel>>,
        wheel: Arc<tokio::sync::Mutex<SimFilterWheel>>,
        status: Arc<RecordingStatus>,
        saver: Arc<CollectingFrameSaver>,
        rig: FlatRig,
    }

    fn bench(supports_open_close: bool, supports_on_off: bool) -> Bench {
        let scene = Arc::new(SimScene::new(10.0, 0.0));
        let camera = Arc::new(tokio::sync::Mutex::new(SimCamera::new(scene.clone(), 16)));
        let panel = Arc::new(tokio::sync::Mutex::new(
            SimFlatPanel::new(scene.clone(), supports_open_close, supports_on_off)));
        let wheel = Arc::new(tokio::sync::Mutex::new(SimFilterWheel::new(&["L", "R", "G"])));
        let status = Arc::new(RecordingStatus::default());
        let saver = Arc::new(CollectingFrameSaver::default());
        let shared_camera: SharedCamera = camera.clone();
        let shared_panel: SharedFlatDevice = panel.clone();
        let shared_wheel: SharedFilterWheel = wheel.clone();
        let rig = FlatRig{
            camera: shared_camera,
            flat_device: Some(shared_panel),
            filter_wheel: Some(shared_wheel),
            guider: None,
            status: status.clone(),
            frame_saver: saver.clone(),
        };
        Bench{scene, camera, panel, wheel, status, saver, rig}
    }

    fn red() -> FilterInfo {
        FilterInfo{name: "R".to_string(), position: 1}
    }

    #[test]
    fn test_key_resolves_default_gain() {
        let info = CameraInfo{connected: true, bit_depth: 16, default_gain: 139};
        let key = trained_flat_key(Some(&red()), BinningMode{x: 2, y: 2}, -1, &info);
        assert_eq!(key, TrainedFlatKey{filter_position: Some(1),
                                       binning: BinningMode{x: 2, y: 2}, gain: 139});
        let key = trained_flat_key(None, BinningMode::default(), 0, &info);
        assert_eq!(key.gain, 0);
        assert_eq!(key.to_string(), "no filter, binning 1x1, gain 0");
    }

    #[test]
    fn test_store_put_replaces() {
        let store = InMemoryTrainedFlatStore::new();
        let key = TrainedFlatKey{filter_position: Some(1), binning: BinningMode::default(),
                                 gain: 100};
        assert!(store.get(&key).is_none());
        store.put(key.clone(), TrainedFlatSetting{brightness: 10, exposure_time: 1.0});
        store.put(key.clone(), TrainedFlatSetting{brightness: 20, exposure_time: 2.0});
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key),
                   Some(TrainedFlatSetting{brightness: 20, exposure_time: 2.0}));
    }

    #[tokio::test]
    async fn test_missing_setting_is_one_issue() {
        let b = bench(true, true);
        let store = Arc::new(InMemoryTrainedFlatStore::new());
        let mut item = TrainedFlatExposure::new(3, Some(red()), store.clone());
        assert!(!item.validate(&b.rig).await);
        assert_eq!(item.core.issues.len(), 1);
        assert!(item.core.issues[0].contains("filter position 1"));

        let cancel = AtomicBool::new(false);
        let err = item.execute(&b.rig, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::TrainedSettingNotFound(_)));
        assert!(b.panel.lock().await.calls.is_empty());
        assert!(b.camera.lock().await.captured.is_empty());

        // Dark flats need the same setting.
        let mut dark = TrainedDarkFlatExposure::new(3, Some(red()), store);
        assert!(!dark.validate(&b.rig).await);
        assert_eq!(dark.core.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_trained_flat_run() {
        let b = bench(true, true);
        let store = Arc::new(InMemoryTrainedFlatStore::new());
        store.put(TrainedFlatKey{filter_position: Some(1), binning: BinningMode::default(),
                                 gain: 100},
                  TrainedFlatSetting{brightness: 400, exposure_time: 2.5});
        let mut item = TrainedFlatExposure::new(3, Some(red()), store);
        assert!(item.validate(&b.rig).await);
        assert!(item.core.issues.is_empty());

        let cancel = AtomicBool::new(false);
        let outcome = item.execute(&b.rig, &cancel).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.frames_captured, 3);
        assert_eq!(report.final_state(), FlatRunState::Done);
        assert_eq!(report.solved_brightness, Some(400));
        assert_eq!(item.core.completed_iterations, 3);
        assert_eq!(item.core.determined_histogram_adu, 10.0 * 400.0 * 2.5);
        assert_eq!(report.adu_stats.count, 3);

        assert_eq!(b.saver.count(), 3);
        let camera = b.camera.lock().await;
        assert!(camera.captured.iter().all(
            |s| s.exposure_time == Duration::from_secs_f64(2.5) &&
                s.image_type == ImageType::Flat && s.gain == -1));
        assert_eq!(b.panel.lock().await.calls,
                   vec!["close_cover", "light on", "brightness 400", "light off",
                        "open_cover"]);
        assert_eq!(b.wheel.lock().await.current, Some(red()));
        assert_eq!(*b.status.clears.lock().unwrap(), vec!["Trained flat exposure"]);

        // Second run: nothing to do.
        let outcome = item.execute(&b.rig, &cancel).await.unwrap();
        assert!(matches!(outcome, FlatRunOutcome::AlreadyComplete));
        assert_eq!(camera.captured.len(), 3);
    }

    #[tokio::test]
    async fn test_dark_flat_keeps_light_off() {
        let b = bench(true, true);
        let store = Arc::new(InMemoryTrainedFlatStore::new());
        store.put(TrainedFlatKey{filter_position: None, binning: BinningMode::default(),
                                 gain: 100},
                  TrainedFlatSetting{brightness: 400, exposure_time: 1.5});
        let mut item = TrainedDarkFlatExposure::new(2, None, store);
        item.keep_panel_closed = true;
        let cancel = AtomicBool::new(false);
        let outcome = item.execute(&b.rig, &cancel).await.unwrap();
        let report = outcome.report().unwrap();

        assert_eq!(b.panel.lock().await.calls, vec!["close_cover", "light off"]);
        assert!(b.scene.cover_closed());
        assert!(!b.scene.light_on());
        assert_eq!(report.step_outcome(StepKind::OpenCover),
                   Some(StepOutcome::Skipped(SkipReason::KeepPanelClosed)));
        assert_eq!(report.step_outcome(StepKind::SwitchFilter),
                   Some(StepOutcome::Skipped(SkipReason::NotRequested)));
        assert_eq!(b.saver.means(), vec![0.0, 0.0]);
        assert!(b.camera.lock().await.captured.iter().all(
            |s| s.image_type == ImageType::DarkFlat));
    }

    #[tokio::test]
    async fn test_failure_still_restores_panel() {
        let b = bench(true, true);
        {
            let mut camera = b.camera.lock().await;
            *camera = SimCamera::new(b.scene.clone(), 16).with_failed_capture(2);
        }
        let store = Arc::new(InMemoryTrainedFlatStore::new());
        store.put(TrainedFlatKey{filter_position: None, binning: BinningMode::default(),
                                 gain: 100},
                  TrainedFlatSetting{brightness: 100, exposure_time: 1.0});
        let mut item = TrainedFlatExposure::new(5, None, store);
        let cancel = AtomicBool::new(false);
        let err = item.execute(&b.rig, &cancel).await.unwrap_err();
        assert!(matches!(err, FlatError::Device(_)));
        assert_eq!(item.core.completed_iterations, 1);
        assert_eq!(b.panel.lock().await.calls,
                   vec!["close_cover", "light on", "brightness 100", "light off",
                        "open_cover"]);
        assert_eq!(b.status.clears.lock().unwrap().len(), 1);
        assert_eq!(b.status.warnings.lock().unwrap().len(), 1);
    }

    struct CountingParent {
        interrupts: Mutex<u32>,
    }

    impl SequenceParent for CountingParent {
        fn interrupt(&self) {
            *self.interrupts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_interrupt_goes_to_parent() {
        let store = Arc::new(InMemoryTrainedFlatStore::new());
        let mut item = TrainedFlatExposure::new(1, None, store);
        let cancel = AtomicBool::new(false);
        item.core.interrupt(&cancel);
        assert!(cancel.load(Ordering::Relaxed));

        let parent = Arc::new(CountingParent{interrupts: Mutex::new(0)});
        item.core.attach_parent(parent.clone());
        let cancel = AtomicBool::new(false);
        item.core.interrupt(&cancel);
        assert!(!cancel.load(Ordering::Relaxed));
        assert_eq!(*parent.interrupts.lock().unwrap(), 1);
    }

}  // mod tests.
