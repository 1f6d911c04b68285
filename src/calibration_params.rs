// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

// Parameter sets for the auto flat items. These are plain values; each
// with_*() returns an updated copy with the min <= max invariant restored.
// Whoever holds the value (UI binding, sequence file loader) is responsible
// for change notification.

fn clamp_fraction(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Parameters for solving panel brightness at a fixed exposure time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlatBrightnessParams {
    min_brightness: i32,
    max_brightness: i32,
    // Fraction (0..1) of full-well ADU to aim for.
    histogram_target: f64,
    // Fraction (0..1) of the target ADU that is acceptable on either side.
    histogram_tolerance: f64,
    keep_panel_closed: bool,
}

impl Default for FlatBrightnessParams {
    fn default() -> Self {
        FlatBrightnessParams{
            min_brightness: 0,
            max_brightness: 32000,
            histogram_target: 0.5,
            histogram_tolerance: 0.1,
            keep_panel_closed: false,
        }
    }
}

impl FlatBrightnessParams {
    pub fn min_brightness(&self) -> i32 { self.min_brightness }
    pub fn max_brightness(&self) -> i32 { self.max_brightness }
    pub fn histogram_target(&self) -> f64 { self.histogram_target }
    pub fn histogram_tolerance(&self) -> f64 { self.histogram_tolerance }
    pub fn keep_panel_closed(&self) -> bool { self.keep_panel_closed }

    pub fn with_min_brightness(self, value: i32) -> Self {
        FlatBrightnessParams{min_brightness: value.min(self.max_brightness), ..self}
    }

    pub fn with_max_brightness(self, value: i32) -> Self {
        FlatBrightnessParams{max_brightness: value.max(self.min_brightness), ..self}
    }

    pub fn with_histogram_target(self, value: f64) -> Self {
        FlatBrightnessParams{histogram_target: clamp_fraction(value), ..self}
    }

    pub fn with_histogram_tolerance(self, value: f64) -> Self {
        FlatBrightnessParams{histogram_tolerance: clamp_fraction(value), ..self}
    }

    pub fn with_keep_panel_closed(self, value: bool) -> Self {
        FlatBrightnessParams{keep_panel_closed: value, ..self}
    }
}

/// Parameters for solving exposure time at a fixed panel brightness (or for
/// sky flats, where there is no panel).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlatExposureParams {
    min_exposure: Duration,
    max_exposure: Duration,
    histogram_target: f64,
    histogram_tolerance: f64,
    keep_panel_closed: bool,
}

impl Default for FlatExposureParams {
    fn default() -> Self {
        FlatExposureParams{
            min_exposure: Duration::from_millis(10),
            max_exposure: Duration::from_secs(10),
            histogram_target: 0.5,
            histogram_tolerance: 0.1,
            keep_panel_closed: false,
        }
    }
}

impl FlatExposureParams {
    pub fn min_exposure(&self) -> Duration { self.min_exposure }
    pub fn max_exposure(&self) -> Duration { self.max_exposure }
    pub fn histogram_target(&self) -> f64 { self.histogram_target }
    pub fn histogram_tolerance(&self) -> f64 { self.histogram_tolerance }
    pub fn keep_panel_closed(&self) -> bool { self.keep_panel_closed }

    pub fn with_min_exposure(self, value: Duration) -> Self {
        FlatExposureParams{min_exposure: value.min(self.max_exposure), ..self}
    }

    pub fn with_max_exposure(self, value: Duration) -> Self {
        FlatExposureParams{max_exposure: value.max(self.min_exposure), ..self}
    }

    pub fn with_histogram_target(self, value: f64) -> Self {
        FlatExposureParams{histogram_target: clamp_fraction(value), ..self}
    }

    pub fn with_histogram_tolerance(self, value: f64) -> Self {
        FlatExposureParams{histogram_tolerance: clamp_fraction(value), ..self}
    }

    pub fn with_keep_panel_closed(self, value: bool) -> Self {
        FlatExposureParams{keep_panel_closed: value, ..self}
    }
}

// mod tests.
