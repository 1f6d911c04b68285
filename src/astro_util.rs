// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Solar geometry for sky flats: where the sun is, whether it is rising, and
// how long twilight lasts at a given place and date.

use astro::angle::{limit_to_two_PI};
use astro::coords::{alt_frm_eq};
use astro::time::{CalType, Date, julian_day, mn_sidr};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use std::time::{Duration, SystemTime};

// Sun altitude (degrees) at apparent sunrise/sunset, including refraction and
// the solar semi-diameter.
pub const SUNRISE_ALTITUDE_DEG: f64 = -0.833;

// Sun altitude (degrees) at the end of nautical twilight.
pub const NAUTICAL_TWILIGHT_ALTITUDE_DEG: f64 = -12.0;

// Resolution of the twilight search.
const SCAN_STEP_SECS: i64 = 60;

fn julian_day_from_utc(dt_utc: &DateTime<Utc>) -> f64 {
    let seconds = dt_utc.time().num_seconds_from_midnight() as f64 +
        dt_utc.time().nanosecond() as f64 / 1e9;
    let date = Date{year: dt_utc.date_naive().year() as i16,
                    month: dt_utc.date_naive().month() as u8,
                    decimal_day: dt_utc.date_naive().day() as f64 + seconds / 86400.0,
                    cal_type: CalType::Gregorian};
    julian_day(&date)
}

fn mean_sidereal_time(dt_utc: &DateTime<Utc>) -> f64 {
    let date = Date{year: dt_utc.date_naive().year() as i16,
                    month: dt_utc.date_naive().month() as u8,
                    decimal_day: dt_utc.date_naive().day() as f64,
                    cal_type: CalType::Gregorian};
    let jd = julian_day(&date);

    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// Returns the sun's (ra, dec) in radians at the given Julian day. Uses the
/// low precision almanac formulae; good to about 0.01 degree.
pub fn sun_equatorial(jd: f64) -> (f64, f64) {
    let n = jd - 2451545.0;
    let mean_long = (280.460 + 0.9856474 * n).to_radians();
    let mean_anomaly = (357.528 + 0.9856003 * n).to_radians();
    let ecliptic_long = mean_long +
        (1.915 * mean_anomaly.sin() + 0.020 * (2.0 * mean_anomaly).sin()).to_radians();
    let obliquity = (23.439 - 0.0000004 * n).to_radians();

    let ra = limit_to_two_PI((obliquity.cos() * ecliptic_long.sin()).atan2(ecliptic_long.cos()));
    let dec = (obliquity.sin() * ecliptic_long.sin()).asin();
    (ra, dec)
}

fn sun_altitude_utc(lat: f64, long: f64, dt_utc: &DateTime<Utc>) -> f64 {
    let (ra, dec) = sun_equatorial(julian_day_from_utc(dt_utc));
    let hour_angle = mean_sidereal_time(dt_utc) + long - ra;
    alt_frm_eq(hour_angle, dec, lat)
}

/// Sun altitude in radians as seen from `lat`, `long` (radians, east
/// positive) at `time`.
pub fn sun_altitude(lat: f64, long: f64, time: SystemTime) -> f64 {
    sun_altitude_utc(lat, long, &DateTime::<Utc>::from(time))
}

/// True if the sun is climbing at `time`.
pub fn is_morning(lat: f64, long: f64, time: SystemTime) -> bool {
    let now = DateTime::<Utc>::from(time);
    let later = now + ChronoDuration::seconds(SCAN_STEP_SECS);
    sun_altitude_utc(lat, long, &later) > sun_altitude_utc(lat, long, &now)
}

// Finds the first time in [start, end) at which the sun's altitude crosses
// `threshold` (radians) in the given direction. Linear interpolation within
// the scan step.
fn find_crossing(lat: f64, long: f64, threshold: f64, rising: bool,
                 start: DateTime<Utc>, end: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let step = ChronoDuration::seconds(SCAN_STEP_SECS);
    let mut t = start;
    let mut alt = sun_altitude_utc(lat, long, &t);
    while t < end {
        let next_t = t + step;
        let next_alt = sun_altitude_utc(lat, long, &next_t);
        let crossed = if rising {
            alt < threshold && next_alt >= threshold
        } else {
            alt > threshold && next_alt <= threshold
        };
        if crossed {
            let fraction = (threshold - alt) / (next_alt - alt);
            let offset_ms = (fraction * (SCAN_STEP_SECS * 1000) as f64).round() as i64;
            return Some(t + ChronoDuration::milliseconds(offset_ms));
        }
        t = next_t;
        alt = next_alt;
    }
    None
}

/// How long the sun takes to get from nautical twilight to sunrise (morning)
/// or from sunset to nautical twilight (evening) on `date` at `lat`, `long`
/// (radians). None if the sun doesn't cross both altitudes that day, as
/// happens near the poles.
pub fn twilight_duration(date: NaiveDate, lat: f64, long: f64, morning: bool)
                         -> Option<Duration> {
    // Scan one day starting at local mean solar midnight, so that the morning
    // and evening twilights of `date` both fall inside the window.
    let utc_midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    let long_offset_secs = (long.to_degrees() / 15.0 * 3600.0).round() as i64;
    let start = utc_midnight - ChronoDuration::seconds(long_offset_secs);
    let end = start + ChronoDuration::days(1);

    let sunrise = SUNRISE_ALTITUDE_DEG.to_radians();
    let nautical = NAUTICAL_TWILIGHT_ALTITUDE_DEG.to_radians();
    let (from, to) = if morning {
        let from = find_crossing(lat, long, nautical, true, start, end)?;
        let to = find_crossing(lat, long, sunrise, true, from, end)?;
        (from, to)
    } else {
        let from = find_crossing(lat, long, sunrise, false, start, end)?;
        let to = find_crossing(lat, long, nautical, false, from, end)?;
        (from, to)
    };
    (to - from).to_std().ok()
}

/// The observer's calendar date at `time`, using local mean solar time.
pub fn local_solar_date(long: f64, time: SystemTime) -> NaiveDate {
    let long_offset_secs = (long.to_degrees() / 15.0 * 3600.0).round() as i64;
    (DateTime::<Utc>::from(time) + ChronoDuration::seconds(long_offset_secs)).date_naive()
}

// mod tests.
