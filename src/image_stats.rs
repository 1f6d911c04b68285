// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;
use statistical;

use crate::device_traits::Gray16Image;

/// Whole-image pixel statistics, in ADU.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageStatistics {
    pub pixel_count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub median_absolute_deviation: f64,
    pub min: u16,
    pub max: u16,
}

impl ImageStatistics {
    pub fn from_image(image: &Gray16Image) -> Self {
        let raw = image.as_raw();
        if raw.is_empty() {
            return ImageStatistics::default();
        }
        let values: Vec<f64> = raw.iter().map(|v| *v as f64).collect();
        let mean = statistical::mean(&values);
        let std_dev = if values.len() > 1 {
            statistical::standard_deviation(&values, Some(mean))
        } else {
            0.0
        };
        let median = values.medf_unchecked();
        let median_absolute_deviation = values.madf(median);
        ImageStatistics{
            pixel_count: values.len(),
            mean,
            median,
            std_dev,
            median_absolute_deviation,
            min: *raw.iter().min().unwrap_or(&0),
            max: *raw.iter().max().unwrap_or(&0),
        }
    }
}

// mod tests.
