// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

/// Where a frame's mean ADU falls relative to the target window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureAduState {
    BelowLowerBound,
    WithinBounds,
    AboveUpperBound,
}

/// Largest value a pixel can take for the given sensor bit depth.
pub fn max_adu(bit_depth: u8) -> f64 {
    // 2^bit_depth - 1, computed in floating point so that 32 bit depths
    // don't overflow.
    2_f64.powi(bit_depth as i32) - 1.0
}

/// The mean ADU we are aiming for, `target_fraction` being the fraction of
/// full-well (0..1).
pub fn target_adu(target_fraction: f64, bit_depth: u8) -> f64 {
    target_fraction * max_adu(bit_depth)
}

/// Classifies `mean_adu` against a window of +/- `tolerance_fraction` of the
/// target ADU. Both fractions are on 0..1.
pub fn get_exposure_adu_state(mean_adu: f64,
                              target_fraction: f64,
                              bit_depth: u8,
                              tolerance_fraction: f64) -> ExposureAduState {
    let target = target_adu(target_fraction, bit_depth);
    let tolerance = tolerance_fraction * target;
    if mean_adu < target - tolerance {
        ExposureAduState::BelowLowerBound
    } else if mean_adu > target + tolerance {
        ExposureAduState::AboveUpperBound
    } else {
        ExposureAduState::WithinBounds
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_max_adu() {
        assert_eq!(max_adu(8), 255.0);
        assert_eq!(max_adu(12), 4095.0);
        assert_eq!(max_adu(16), 65535.0);
    }

    #[test]
    fn test_classify_16_bit() {
        // Target 32767.5, window +/- 3276.75.
        assert_eq!(get_exposure_adu_state(29000.0, 0.5, 16, 0.1),
                   ExposureAduState::BelowLowerBound);
        assert_eq!(get_exposure_adu_state(32767.5, 0.5, 16, 0.1),
                   ExposureAduState::WithinBounds);
        assert_eq!(get_exposure_adu_state(36044.0, 0.5, 16, 0.1),
                   ExposureAduState::WithinBounds);
        assert_eq!(get_exposure_adu_state(36045.0, 0.5, 16, 0.1),
                   ExposureAduState::AboveUpperBound);
    }

    #[test]
    fn test_classify_scales_with_bit_depth() {
        // The same fractional brightness classifies the same way regardless of
        // the sensor's bit depth.
        for bit_depth in [8_u8, 12, 14, 16] {
            let max = max_adu(bit_depth);
            assert_eq!(get_exposure_adu_state(0.30 * max, 0.5, bit_depth, 0.1),
                       ExposureAduState::BelowLowerBound);
            assert_eq!(get_exposure_adu_state(0.52 * max, 0.5, bit_depth, 0.1),
                       ExposureAduState::WithinBounds);
            assert_eq!(get_exposure_adu_state(0.70 * max, 0.5, bit_depth, 0.1),
                       ExposureAduState::AboveUpperBound);
        }
        assert_abs_diff_eq!(target_adu(0.5, 12), 2047.5, epsilon = 1e-9);
    }

    #[test]
    fn test_classify_is_monotonic() {
        let rank = |state: ExposureAduState| match state {
            ExposureAduState::BelowLowerBound => 0,
            ExposureAduState::WithinBounds => 1,
            ExposureAduState::AboveUpperBound => 2,
        };
        for (target, tolerance, bit_depth) in
            [(0.5, 0.1, 16_u8), (0.3, 0.05, 12), (0.8, 0.2, 8), (0.5, 0.0, 16)]
        {
            let max = max_adu(bit_depth);
            let mut prev_rank = 0;
            let steps = 2000;
            for step in 0..=steps {
                let mean = max * step as f64 / steps as f64;
                let r = rank(get_exposure_adu_state(mean, target, bit_depth, tolerance));
                assert!(r >= prev_rank,
                        "classification went backwards at mean {}", mean);
                prev_rank = r;
            }
            assert_eq!(prev_rank, 2);
        }
    }

}  // mod tests.
