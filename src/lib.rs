pub mod astro_util;
pub mod auto_flats;
pub mod calibration_params;
pub mod device_traits;
pub mod exposure_solver;
pub mod flat_error;
pub mod flat_sequence;
pub mod histogram_math;
pub mod image_stats;
pub mod simulated_rig;
pub mod sky_flat;
pub mod trained_flats;
pub mod twilight_model;
pub mod value_stats;
