// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, CanonicalErrorCode, aborted_error,
                      failed_precondition_error};

use crate::trained_flats::TrainedFlatKey;

/// Which side of the allowed range the bisection search collapsed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationFailure {
    // Even the top of the range did not reach the target ADU.
    TooDim,
    // Even the bottom of the range exceeded the target ADU.
    TooBright,
}

impl fmt::Display for CalibrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationFailure::TooDim => write!(
                f, "light too dim to reach the histogram target within the allowed range"),
            CalibrationFailure::TooBright => write!(
                f, "light too bright to reach the histogram target within the allowed range"),
        }
    }
}

#[derive(Debug)]
pub enum FlatError {
    /// The bisection search used up its iterations without reaching the
    /// target window.
    Convergence(CalibrationFailure),

    /// No trained flat setting exists for the key.
    TrainedSettingNotFound(TrainedFlatKey),

    /// Cooperative cancellation; the string names where it was noticed.
    Cancelled(String),

    /// A collaborator (camera, flat device, filter wheel, guider) failed.
    Device(CanonicalError),
}

impl fmt::Display for FlatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatError::Convergence(failure) => write!(f, "Flat calibration failed: {}", failure),
            FlatError::TrainedSettingNotFound(key) =>
                write!(f, "No trained flat setting for {}", key),
            FlatError::Cancelled(context) => write!(f, "Cancelled during {}", context),
            FlatError::Device(e) => write!(f, "Device error: {}", e),
        }
    }
}

impl std::error::Error for FlatError {}

impl From<CanonicalError> for FlatError {
    fn from(e: CanonicalError) -> Self {
        FlatError::Device(e)
    }
}

impl From<FlatError> for CanonicalError {
    fn from(e: FlatError) -> Self {
        match e {
            FlatError::Convergence(_) | FlatError::TrainedSettingNotFound(_) =>
                failed_precondition_error(e.to_string().as_str()),
            FlatError::Cancelled(_) => aborted_error(e.to_string().as_str()),
            FlatError::Device(inner) => inner,
        }
    }
}

impl FlatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlatError::Cancelled(_))
    }
}

/// Returns `FlatError::Cancelled` if `cancel` has been raised.
pub fn check_cancel(cancel: &AtomicBool, context: &str) -> Result<(), FlatError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(FlatError::Cancelled(context.to_string()));
    }
    Ok(())
}

/// Converts an error returned by a device. A device call that was aborted,
/// or that failed while `cancel` was raised, is a cancellation.
pub fn device_error(e: CanonicalError, cancel: &AtomicBool, context: &str) -> FlatError {
    if cancel.load(Ordering::Relaxed) || matches!(e.code, CanonicalErrorCode::Aborted) {
        return FlatError::Cancelled(format!("{} ({})", context, e.message));
    }
    FlatError::Device(e)
}

#[cfg(test)]
mod tests {
    use canonical_error::unavailable_error;
    use super::*;

    #[test]
    fn test_canonical_conversion() {
        let e: CanonicalError = FlatError::Convergence(CalibrationFailure::TooDim).into();
        assert!(matches!(e.code, CanonicalErrorCode::FailedPrecondition));
        assert!(e.message.contains("too dim"));

        let e: CanonicalError = FlatError::Cancelled("solve".to_string()).into();
        assert!(matches!(e.code, CanonicalErrorCode::Aborted));

        let device: FlatError = aborted_error("camera gone").into();
        assert!(matches!(device, FlatError::Device(_)));
        assert!(!device.is_cancelled());
    }

    #[test]
    fn test_check_cancel() {
        let cancel = AtomicBool::new(false);
        assert!(check_cancel(&cancel, "test").is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert!(check_cancel(&cancel, "test").unwrap_err().is_cancelled());
    }

    #[test]
    fn test_device_error() {
        let cancel = AtomicBool::new(false);
        let e = device_error(unavailable_error("panel offline"), &cancel, "close cover");
        assert!(matches!(e, FlatError::Device(_)));
        let e = device_error(aborted_error("Exposure cancelled"), &cancel, "flat capture");
        assert!(e.is_cancelled());
        assert_eq!(e.to_string(), "Cancelled during flat capture (Exposure cancelled)");

        // Whatever the device says, it failed because the run was cancelled.
        cancel.store(true, Ordering::Relaxed);
        let e = device_error(unavailable_error("panel offline"), &cancel, "close cover");
        assert!(e.is_cancelled());
    }

}  // mod tests.
