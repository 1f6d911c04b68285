// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::SystemTime;

use chrono::{Datelike, NaiveDate};
use log::{debug, warn};

use crate::astro_util::{local_solar_date, twilight_duration};

// Sky brightness changes by this many magnitudes per second during twilight,
// at the reference (equinox) rate.
pub const TWILIGHT_DECAY_RATE: f64 = 0.094 / 60.0;

/// Extrapolates sky flat exposure times as the twilight sky brightens or
/// fades. Exposure times are in seconds.
///
/// With sky brightness varying as a^t, an exposure that starts at elapsed
/// time t0 and collects the same signal as the first exposure `s` lasts
///   ln(a^t0 + s ln a) / ln a - t0
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TwilightModel {
    pub first_exposure_time: f64,

    // Ratio of today's twilight duration to the equinox twilight duration.
    pub tau: f64,

    // Positive in the morning, negative in the evening.
    pub k: f64,

    // 10^(k / tau).
    pub a: f64,

    pub current_exposure_time: f64,
}

impl TwilightModel {
    pub fn new(first_exposure_time: f64, tau: f64, morning: bool) -> Self {
        let k = if morning { TWILIGHT_DECAY_RATE } else { -TWILIGHT_DECAY_RATE };
        TwilightModel{
            first_exposure_time,
            tau,
            k,
            a: 10_f64.powf(k / tau),
            current_exposure_time: first_exposure_time,
        }
    }

    /// Exposure time for a frame that starts `ti` seconds after the first
    /// frame started, plus `trot` seconds of overhead (readout, dither). May
    /// be NaN or non-positive once the sky has changed too much for the
    /// model.
    pub fn next_exposure_time(&self, ti: f64, trot: f64) -> f64 {
        let t0 = ti + trot;
        let ln_a = self.a.ln();
        (self.a.powf(t0) + self.first_exposure_time * ln_a).ln() / ln_a - t0
    }

    /// Like next_exposure_time(), but records the result as the current
    /// exposure time. Returns None if the model has no usable answer.
    pub fn advance(&mut self, ti: f64, trot: f64) -> Option<f64> {
        let t = self.next_exposure_time(ti, trot);
        if !t.is_finite() || t <= 0.0 {
            debug!("Twilight model gave unusable exposure {} at t={}", t, ti + trot);
            return None;
        }
        self.current_exposure_time = t;
        Some(t)
    }
}

// Reference date for twilight durations: the (approximate) March equinox of
// `date`'s year.
fn equinox_of_year(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), 3, 20)
}

/// Ratio of the twilight duration at `time` to that of the March equinox, at
/// `lat`, `long` (radians). Falls back to 1.0 where twilight can't be
/// determined (polar day or night).
pub fn twilight_ratio(lat: f64, long: f64, time: SystemTime, morning: bool) -> f64 {
    let today = local_solar_date(long, time);
    let today_duration = twilight_duration(today, lat, long, morning);
    let reference_duration = equinox_of_year(today).and_then(
        |equinox| twilight_duration(equinox, lat, long, morning));
    match (today_duration, reference_duration) {
        (Some(today_duration), Some(reference_duration))
            if reference_duration.as_secs_f64() > 0.0 =>
        {
            today_duration.as_secs_f64() / reference_duration.as_secs_f64()
        }
        _ => {
            warn!("Could not determine {} twilight duration for {}; using tau 1.0",
                  if morning { "morning" } else { "evening" }, today);
            1.0
        }
    }
}

// mod tests.
