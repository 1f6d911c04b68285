// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Simulated equipment for exercising the flat items without hardware: a
// camera that sees a flat panel and/or the twilight sky, a flat panel, a
// filter wheel, a guider, and recording status and frame sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, aborted_error, failed_precondition_error,
                      unavailable_error};
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;

use crate::device_traits::{ApplicationStatus, CameraInfo, ExposureSpec, FilterInfo,
                           FilterWheel, FilterWheelInfo, FlatCamera, FlatDevice,
                           FlatDeviceInfo, FrameSaver, Gray16Image, Guider, GuiderInfo,
                           PrepareParams, RawExposure, RenderedImage, StatusSink};
use crate::histogram_math::max_adu;

#[derive(Clone, Copy, Debug, Default)]
struct PanelState {
    brightness: i32,
    light_on: bool,
    cover_closed: bool,
}

/// The light reaching the simulated sensor. Shared between the simulated
/// camera and flat panel.
pub struct SimScene {
    // ADU per second per unit of panel brightness, when the light is on.
    panel_flux: f64,

    // Sky ADU per second, as a function of seconds on the scene clock. The
    // sky is blocked while the cover is closed.
    sky_flux: Box<dyn Fn(f64) -> f64 + Send + Sync>,

    // Added to every pixel.
    bias: f64,

    panel: Mutex<PanelState>,

    // Seconds of exposure time accumulated so far.
    clock: Mutex<f64>,
}

impl SimScene {
    pub fn new(panel_flux: f64, bias: f64) -> Self {
        SimScene{
            panel_flux,
            sky_flux: Box::new(|_t| 0.0),
            bias,
            panel: Mutex::new(PanelState::default()),
            clock: Mutex::new(0.0),
        }
    }

    pub fn with_sky(mut self, sky_flux: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.sky_flux = Box::new(sky_flux);
        self
    }

    /// Sky that brightens (rate > 0) or fades (rate < 0) by `rate` magnitudes
    /// per second of scene clock, starting at `flux` ADU per second.
    pub fn twilight_sky(flux: f64, rate: f64) -> impl Fn(f64) -> f64 + Send + Sync {
        move |t| flux * 10_f64.powf(rate * t)
    }

    pub fn brightness(&self) -> i32 {
        self.panel.lock().unwrap().brightness
    }

    pub fn light_on(&self) -> bool {
        self.panel.lock().unwrap().light_on
    }

    pub fn cover_closed(&self) -> bool {
        self.panel.lock().unwrap().cover_closed
    }

    pub fn clock(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    // Mean ADU of an exposure of `seconds` starting now; advances the clock.
    fn expose(&self, seconds: f64) -> f64 {
        let panel = *self.panel.lock().unwrap();
        let mut clock = self.clock.lock().unwrap();
        let mid_time = *clock + seconds / 2.0;
        *clock += seconds;
        let mut flux = 0.0;
        if panel.light_on {
            flux += self.panel_flux * panel.brightness as f64;
        }
        if !panel.cover_closed {
            flux += (self.sky_flux)(mid_time);
        }
        self.bias + flux * seconds
    }
}

pub struct SimCamera {
    info: CameraInfo,
    scene: Arc<SimScene>,
    width: u32,
    height: u32,

    // Peak deviation of the uniform per-pixel noise, in ADU.
    noise_adu: f64,
    rng: SmallRng,

    // When set, capture_image() takes as long as the exposure.
    real_time: bool,
    download_time: Duration,

    // Every spec passed to capture_image(), in order.
    pub captured: Vec<ExposureSpec>,

    // Fail the capture with this (1-based) sequence number.
    fail_capture: Option<usize>,
}

impl SimCamera {
    pub fn new(scene: Arc<SimScene>, bit_depth: u8) -> Self {
        SimCamera{
            info: CameraInfo{connected: true, bit_depth, default_gain: 100},
            scene,
            width: 32,
            height: 24,
            noise_adu: 0.0,
            rng: SmallRng::seed_from_u64(42),
            real_time: false,
            download_time: Duration::ZERO,
            captured: Vec::new(),
            fail_capture: None,
        }
    }

    pub fn with_noise(mut self, noise_adu: f64) -> Self {
        self.noise_adu = noise_adu;
        self
    }

    pub fn with_real_time(mut self, download_time: Duration) -> Self {
        self.real_time = true;
        self.download_time = download_time;
        self
    }

    pub fn with_default_gain(mut self, gain: i32) -> Self {
        self.info.default_gain = gain;
        self
    }

    pub fn with_failed_capture(mut self, sequence_number: usize) -> Self {
        self.fail_capture = Some(sequence_number);
        self
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.info.connected = connected;
    }
}

#[async_trait]
impl FlatCamera for SimCamera {
    fn get_info(&self) -> CameraInfo {
        self.info
    }

    async fn capture_image(&mut self, spec: &ExposureSpec, cancel: &AtomicBool)
                           -> Result<RawExposure, CanonicalError> {
        if !self.info.connected {
            return Err(failed_precondition_error("Camera not connected"));
        }
        self.captured.push(spec.clone());
        if self.fail_capture == Some(self.captured.len()) {
            return Err(unavailable_error("Simulated camera failure"));
        }
        let start_time = SystemTime::now();
        if self.real_time {
            tokio::time::sleep(spec.exposure_time).await;
        }
        if cancel.load(Ordering::Relaxed) {
            return Err(aborted_error("Exposure cancelled"));
        }
        let seconds = spec.exposure_time.as_secs_f64();
        let mean = self.scene.expose(seconds);
        let ceiling = max_adu(self.info.bit_depth);
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for _ in 0..self.width * self.height {
            let noise = if self.noise_adu > 0.0 {
                self.rng.gen_range(-self.noise_adu..=self.noise_adu)
            } else {
                0.0
            };
            pixels.push((mean + noise).round().clamp(0.0, ceiling) as u16);
        }
        let image = match Gray16Image::from_raw(self.width, self.height, pixels) {
            Some(image) => image,
            None => return Err(failed_precondition_error("Bad simulated image size")),
        };
        debug!("Simulated {:?} exposure {:.4}s: mean {:.1}", spec.image_type, seconds, mean);
        Ok(RawExposure{image: Arc::new(image), bit_depth: self.info.bit_depth,
                       spec: spec.clone(), start_time})
    }

    async fn prepare_image(&mut self, raw: RawExposure, _params: &PrepareParams,
                           cancel: &AtomicBool)
                           -> Result<RenderedImage, CanonicalError> {
        if self.real_time && !self.download_time.is_zero() {
            tokio::time::sleep(self.download_time).await;
        }
        if cancel.load(Ordering::Relaxed) {
            return Err(aborted_error("Download cancelled"));
        }
        Ok(RenderedImage::new(raw, self.download_time))
    }
}

pub struct SimFlatPanel {
    info: FlatDeviceInfo,
    scene: Arc<SimScene>,

    // Commands received, e.g. "close_cover", "brightness 120", "light on".
    pub calls: Vec<String>,

    // Fail any command whose text starts with this.
    fail_command: Option<String>,

    // Drop the connection once this many commands have been received.
    disconnect_after: Option<usize>,
}

impl SimFlatPanel {
    pub fn new(scene: Arc<SimScene>, supports_open_close: bool, supports_on_off: bool)
               -> Self {
        // A panel without a switch is lit whenever it has power.
        if !supports_on_off {
            scene.panel.lock().unwrap().light_on = true;
        }
        SimFlatPanel{
            info: FlatDeviceInfo{
                connected: true,
                supports_open_close,
                supports_on_off,
                light_on: false,
                min_brightness: 0,
                max_brightness: 32000,
            },
            scene,
            calls: Vec::new(),
            fail_command: None,
            disconnect_after: None,
        }
    }

    pub fn with_disconnect_after(mut self, commands: usize) -> Self {
        self.disconnect_after = Some(commands);
        self
    }

    pub fn with_failed_command(mut self, command: &str) -> Self {
        self.fail_command = Some(command.to_string());
        self
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.info.connected = connected;
    }

    fn command(&mut self, command: String) -> Result<(), CanonicalError> {
        if !self.info.connected {
            return Err(failed_precondition_error("Flat panel not connected"));
        }
        let failing = self.fail_command.as_ref().is_some_and(|f| command.starts_with(f));
        self.calls.push(command);
        if self.disconnect_after == Some(self.calls.len()) {
            self.info.connected = false;
        }
        if failing {
            return Err(unavailable_error("Simulated flat panel failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl FlatDevice for SimFlatPanel {
    fn get_info(&self) -> FlatDeviceInfo {
        let mut info = self.info;
        info.light_on = self.scene.light_on();
        info
    }

    async fn set_brightness(&mut self, brightness: i32, _cancel: &AtomicBool)
                            -> Result<(), CanonicalError> {
        self.command(format!("brightness {}", brightness))?;
        let clamped = brightness.clamp(self.info.min_brightness, self.info.max_brightness);
        self.scene.panel.lock().unwrap().brightness = clamped;
        Ok(())
    }

    async fn toggle_light(&mut self, on: bool, _cancel: &AtomicBool)
                          -> Result<(), CanonicalError> {
        self.command(format!("light {}", if on { "on" } else { "off" }))?;
        self.scene.panel.lock().unwrap().light_on = on;
        Ok(())
    }

    async fn open_cover(&mut self, _cancel: &AtomicBool) -> Result<(), CanonicalError> {
        self.command("open_cover".to_string())?;
        self.scene.panel.lock().unwrap().cover_closed = false;
        Ok(())
    }

    async fn close_cover(&mut self, _cancel: &AtomicBool) -> Result<(), CanonicalError> {
        self.command("close_cover".to_string())?;
        self.scene.panel.lock().unwrap().cover_closed = true;
        Ok(())
    }
}

pub struct SimFilterWheel {
    info: FilterWheelInfo,
    filters: Vec<FilterInfo>,
    pub current: Option<FilterInfo>,
    pub switch_count: u32,
}

impl SimFilterWheel {
    pub fn new(names: &[&str]) -> Self {
        let filters = names.iter().enumerate().map(
            |(i, name)| FilterInfo{name: name.to_string(), position: i as u16}).collect();
        SimFilterWheel{info: FilterWheelInfo{connected: true}, filters,
                       current: None, switch_count: 0}
    }

    pub fn filter(&self, name: &str) -> Option<FilterInfo> {
        self.filters.iter().find(|f| f.name == name).cloned()
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.info.connected = connected;
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    fn get_info(&self) -> FilterWheelInfo {
        self.info
    }

    async fn switch_filter(&mut self, filter: &FilterInfo, _cancel: &AtomicBool)
                           -> Result<FilterInfo, CanonicalError> {
        let selected = match self.filters.get(filter.position as usize) {
            Some(selected) => selected.clone(),
            None => return Err(failed_precondition_error(
                format!("No filter at position {}", filter.position).as_str())),
        };
        self.switch_count += 1;
        self.current = Some(selected.clone());
        Ok(selected)
    }
}

pub struct SimGuider {
    info: GuiderInfo,
    settle_time: Duration,
    fail: bool,
    pub dither_count: u32,
}

impl SimGuider {
    pub fn new(settle_time: Duration) -> Self {
        SimGuider{info: GuiderInfo{connected: true, can_dither: true},
                  settle_time, fail: false, dither_count: 0}
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn set_info(&mut self, info: GuiderInfo) {
        self.info = info;
    }
}

#[async_trait]
impl Guider for SimGuider {
    fn get_info(&self) -> GuiderInfo {
        self.info
    }

    async fn dither(&mut self, cancel: &AtomicBool) -> Result<bool, CanonicalError> {
        self.dither_count += 1;
        if !self.settle_time.is_zero() {
            tokio::time::sleep(self.settle_time).await;
        }
        if cancel.load(Ordering::Relaxed) {
            return Err(aborted_error("Dither cancelled"));
        }
        if self.fail {
            return Err(unavailable_error("Simulated guider failure"));
        }
        Ok(true)
    }
}

/// Status sink that keeps everything it is told, and echoes it to the log.
#[derive(Default)]
pub struct RecordingStatus {
    pub reports: Mutex<Vec<ApplicationStatus>>,
    pub warnings: Mutex<Vec<String>>,
    pub clears: Mutex<Vec<String>>,
}

impl StatusSink for RecordingStatus {
    fn report(&self, status: ApplicationStatus) {
        debug!("[{}] {}", status.source, status.status);
        self.reports.lock().unwrap().push(status);
    }

    fn notify_warning(&self, message: &str) {
        warn!("{}", message);
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn clear(&self, source: &str) {
        self.clears.lock().unwrap().push(source.to_string());
    }
}

/// Frame saver that holds on to the frames.
#[derive(Default)]
pub struct CollectingFrameSaver {
    pub frames: Mutex<Vec<RenderedImage>>,
}

impl CollectingFrameSaver {
    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn means(&self) -> Vec<f64> {
        self.frames.lock().unwrap().iter().map(|f| f.statistics().mean).collect()
    }
}

impl FrameSaver for CollectingFrameSaver {
    fn enqueue(&self, image: RenderedImage) {
        info!("Saving {:?} frame, {:.4}s, mean {:.1} ADU",
              image.spec.image_type, image.spec.exposure_time.as_secs_f64(),
              image.statistics().mean);
        self.frames.lock().unwrap().push(image);
    }
}

#[cfg(test)]
mod tests {
    use crate::device_traits::{BinningMode, ImageType};
    use super::*;

    fn spec(seconds: f64) -> ExposureSpec {
        ExposureSpec{exposure_time: Duration::from_secs_f64(seconds),
                     image_type: ImageType::Flat, filter: None,
                     binning: BinningMode::default(), gain: -1}
    }

    #[tokio::test]
    async fn test_camera_sees_panel() {
        let scene = Arc::new(SimScene::new(10.0, 100.0));
        let mut panel = SimFlatPanel::new(scene.clone(), true, true);
        let mut camera = SimCamera::new(scene.clone(), 16);
        let cancel = AtomicBool::new(false);

        // Light off: bias only.
        let raw = camera.capture_image(&spec(2.0), &cancel).await.unwrap();
        let image = camera.prepare_image(raw, &PrepareParams::default(), &cancel)
            .await.unwrap();
        assert_eq!(image.statistics().mean, 100.0);

        panel.toggle_light(true, &cancel).await.unwrap();
        panel.set_brightness(500, &cancel).await.unwrap();
        let raw = camera.capture_image(&spec(2.0), &cancel).await.unwrap();
        assert_eq!(raw.image.as_raw()[0], 100 + 10 * 500 * 2);
        assert_eq!(scene.clock(), 4.0);
        assert_eq!(panel.calls, vec!["light on", "brightness 500"]);
        assert!(panel.get_info().light_on);
        assert_eq!(camera.captured.len(), 2);
    }

    #[tokio::test]
    async fn test_camera_saturates_and_adds_noise() {
        let scene = Arc::new(SimScene::new(0.0, 0.0)
                             .with_sky(SimScene::twilight_sky(100000.0, 0.0)));
        let mut camera = SimCamera::new(scene.clone(), 12).with_noise(5.0);
        let cancel = AtomicBool::new(false);
        let raw = camera.capture_image(&spec(1.0), &cancel).await.unwrap();
        assert!(raw.image.as_raw().iter().all(|p| *p == 4095));

        let scene = Arc::new(SimScene::new(0.0, 1000.0));
        let mut camera = SimCamera::new(scene, 16).with_noise(5.0);
        let raw = camera.capture_image(&spec(1.0), &cancel).await.unwrap();
        let pixels = raw.image.as_raw();
        assert!(pixels.iter().all(|p| (995..=1005).contains(p)));
        assert!(pixels.iter().any(|p| *p != 1000));
    }

    #[tokio::test]
    async fn test_cover_blocks_sky() {
        let scene = Arc::new(SimScene::new(0.0, 0.0)
                             .with_sky(SimScene::twilight_sky(1000.0, 0.0)));
        let mut panel = SimFlatPanel::new(scene.clone(), true, false);
        let mut camera = SimCamera::new(scene.clone(), 16);
        let cancel = AtomicBool::new(false);
        panel.close_cover(&cancel).await.unwrap();
        let raw = camera.capture_image(&spec(1.0), &cancel).await.unwrap();
        assert_eq!(raw.image.as_raw()[0], 0);
        panel.open_cover(&cancel).await.unwrap();
        let raw = camera.capture_image(&spec(1.0), &cancel).await.unwrap();
        assert_eq!(raw.image.as_raw()[0], 1000);
    }

    #[tokio::test]
    async fn test_failures() {
        let scene = Arc::new(SimScene::new(1.0, 0.0));
        let mut camera = SimCamera::new(scene.clone(), 16).with_failed_capture(2);
        let cancel = AtomicBool::new(false);
        assert!(camera.capture_image(&spec(1.0), &cancel).await.is_ok());
        assert!(camera.capture_image(&spec(1.0), &cancel).await.is_err());
        assert!(camera.capture_image(&spec(1.0), &cancel).await.is_ok());

        let mut panel = SimFlatPanel::new(scene, true, true).with_failed_command("light");
        assert!(panel.toggle_light(true, &cancel).await.is_err());
        assert!(panel.close_cover(&cancel).await.is_ok());
        panel.set_connected(false);
        assert!(panel.open_cover(&cancel).await.is_err());

        let mut guider = SimGuider::new(Duration::ZERO).with_failure();
        assert!(guider.dither(&cancel).await.is_err());
        assert_eq!(guider.dither_count, 1);
    }

    #[tokio::test]
    async fn test_filter_wheel() {
        let mut wheel = SimFilterWheel::new(&["L", "R", "G", "B"]);
        let cancel = AtomicBool::new(false);
        let green = wheel.filter("G").unwrap();
        assert_eq!(green.position, 2);
        let selected = wheel.switch_filter(&green, &cancel).await.unwrap();
        assert_eq!(selected, green);
        assert_eq!(wheel.current, Some(green));
        let bogus = FilterInfo{name: "Ha".to_string(), position: 7};
        assert!(wheel.switch_filter(&bogus, &cancel).await.is_err());
        assert_eq!(wheel.switch_count, 1);
    }

}  // mod tests.
