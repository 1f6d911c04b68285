// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Interfaces to the equipment and services that flat calibration drives. The
// implementations (device drivers, the imaging pipeline, the guider client,
// the UI status bar) live outside of this crate; see simulated_rig.rs for
// stand-ins.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::CanonicalError;
use image::{ImageBuffer, Luma};

use crate::image_stats::ImageStatistics;

pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BinningMode {
    pub x: u8,
    pub y: u8,
}

impl Default for BinningMode {
    fn default() -> Self {
        BinningMode{x: 1, y: 1}
    }
}

impl fmt::Display for BinningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterInfo {
    pub name: String,
    // Slot in the filter wheel, zero based.
    pub position: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    Flat,
    DarkFlat,
}

#[derive(Clone, Debug)]
pub struct ExposureSpec {
    pub exposure_time: Duration,
    pub image_type: ImageType,
    pub filter: Option<FilterInfo>,
    pub binning: BinningMode,
    // -1 means the camera's default gain.
    pub gain: i32,
}

/// An exposure as it comes off the camera, before any processing.
#[derive(Clone)]
pub struct RawExposure {
    pub image: Arc<Gray16Image>,
    pub bit_depth: u8,
    pub spec: ExposureSpec,
    // When the exposure integration began.
    pub start_time: SystemTime,
}

#[derive(Clone, Debug, Default)]
pub struct PrepareParams {
    pub debayer: bool,
    pub calibrate: bool,
}

/// A prepared (calibrated, debayered) image. Statistics are computed on first
/// request and cached.
#[derive(Clone)]
pub struct RenderedImage {
    pub image: Arc<Gray16Image>,
    pub bit_depth: u8,
    pub spec: ExposureSpec,
    pub start_time: SystemTime,

    // Time from the end of the exposure integration until this image became
    // available (readout, download, preparation).
    pub download_duration: Duration,

    statistics: Arc<OnceLock<ImageStatistics>>,
}

impl RenderedImage {
    pub fn new(raw: RawExposure, download_duration: Duration) -> Self {
        RenderedImage{
            image: raw.image,
            bit_depth: raw.bit_depth,
            spec: raw.spec,
            start_time: raw.start_time,
            download_duration,
            statistics: Arc::new(OnceLock::new()),
        }
    }

    pub fn statistics(&self) -> &ImageStatistics {
        self.statistics.get_or_init(|| ImageStatistics::from_image(&self.image))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CameraInfo {
    pub connected: bool,
    pub bit_depth: u8,
    // Gain used when an exposure asks for gain -1.
    pub default_gain: i32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlatDeviceInfo {
    pub connected: bool,
    // Whether the device has a motorized cover.
    pub supports_open_close: bool,
    // Whether the light can be switched on and off.
    pub supports_on_off: bool,
    pub light_on: bool,
    pub min_brightness: i32,
    pub max_brightness: i32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FilterWheelInfo {
    pub connected: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GuiderInfo {
    pub connected: bool,
    // False when the guider is not guiding or the mount is parked.
    pub can_dither: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplicationStatus {
    pub status: String,
    pub progress: f64,
    pub max_progress: f64,
    // Which sequence item the status belongs to.
    pub source: String,
}

#[async_trait]
pub trait FlatCamera {
    fn get_info(&self) -> CameraInfo;

    // Returns once the exposure integration has ended. The image data is
    // available for prepare_image().
    async fn capture_image(&mut self, spec: &ExposureSpec, cancel: &AtomicBool)
                           -> Result<RawExposure, CanonicalError>;

    async fn prepare_image(&mut self, raw: RawExposure, params: &PrepareParams,
                           cancel: &AtomicBool)
                           -> Result<RenderedImage, CanonicalError>;
}

/// A flat panel, or flip-flat style cover with an illuminator.
#[async_trait]
pub trait FlatDevice {
    fn get_info(&self) -> FlatDeviceInfo;

    async fn set_brightness(&mut self, brightness: i32, cancel: &AtomicBool)
                            -> Result<(), CanonicalError>;
    async fn toggle_light(&mut self, on: bool, cancel: &AtomicBool)
                          -> Result<(), CanonicalError>;
    async fn open_cover(&mut self, cancel: &AtomicBool) -> Result<(), CanonicalError>;
    async fn close_cover(&mut self, cancel: &AtomicBool) -> Result<(), CanonicalError>;
}

#[async_trait]
pub trait FilterWheel {
    fn get_info(&self) -> FilterWheelInfo;

    // Returns the filter actually selected.
    async fn switch_filter(&mut self, filter: &FilterInfo, cancel: &AtomicBool)
                           -> Result<FilterInfo, CanonicalError>;
}

#[async_trait]
pub trait Guider {
    fn get_info(&self) -> GuiderInfo;

    // Returns false if the guider declined to dither.
    async fn dither(&mut self, cancel: &AtomicBool) -> Result<bool, CanonicalError>;
}

/// Receives progress updates; fire-and-forget.
pub trait StatusSink {
    fn report(&self, status: ApplicationStatus);

    fn notify_warning(&self, message: &str);

    // Removes whatever status `source` last posted.
    fn clear(&self, source: &str);
}

/// Accepts frames for saving; fire-and-forget.
pub trait FrameSaver {
    fn enqueue(&self, image: RenderedImage);
}
