// Sound dose error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Sound dose error code constants
///
/// Single source of truth for the numeric codes carried by [`DoseError`]
/// across the HTTP control surface and the diagnostics CLI.
///
/// Error code range: 3001-3005
pub struct DoseErrorCodes {}

impl DoseErrorCodes {
    /// RS2 value outside [80, 100] dBA
    pub const INVALID_ARGUMENT: i32 = 3001;

    /// Mutex was poisoned
    pub const LOCK_POISONED: i32 = 3002;

    /// MEL processor could not be constructed
    pub const PROCESSOR_CREATION_FAILED: i32 = 3003;

    /// Control surface was replaced or its listener died
    pub const INTERFACE_REVOKED: i32 = 3004;

    /// Configuration value rejected
    pub const CONFIG_INVALID: i32 = 3005;
}

/// Log a sound dose error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_dose_error(err: &DoseError, context: &str) {
    error!(
        "Sound dose error in {}: code={}, component=SoundDoseManager, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Sound dose errors
///
/// Only policy violations and resource failures are surfaced. Unknown stream
/// handles and missing listeners are resolved locally and never reach here.
#[derive(Debug, Clone, PartialEq)]
pub enum DoseError {
    /// RS2 threshold outside the inclusive [80.0, 100.0] dBA range
    InvalidArgument { value: f32 },

    /// Mutex was poisoned
    LockPoisoned { component: String },

    /// MEL processor construction failed
    ProcessorCreationFailed { reason: String },

    /// The control surface no longer owns the listener registration
    InterfaceRevoked,

    /// Configuration rejected
    ConfigInvalid { reason: String },
}

impl ErrorCode for DoseError {
    fn code(&self) -> i32 {
        match self {
            DoseError::InvalidArgument { .. } => DoseErrorCodes::INVALID_ARGUMENT,
            DoseError::LockPoisoned { .. } => DoseErrorCodes::LOCK_POISONED,
            DoseError::ProcessorCreationFailed { .. } => DoseErrorCodes::PROCESSOR_CREATION_FAILED,
            DoseError::InterfaceRevoked => DoseErrorCodes::INTERFACE_REVOKED,
            DoseError::ConfigInvalid { .. } => DoseErrorCodes::CONFIG_INVALID,
        }
    }

    fn message(&self) -> String {
        match self {
            DoseError::InvalidArgument { value } => {
                format!("RS2 must be within [80.0, 100.0] dBA (got {})", value)
            }
            DoseError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            DoseError::ProcessorCreationFailed { reason } => {
                format!("Failed to create MEL processor: {}", reason)
            }
            DoseError::InterfaceRevoked => {
                "Sound dose interface revoked. Register a new callback.".to_string()
            }
            DoseError::ConfigInvalid { reason } => {
                format!("Invalid configuration: {}", reason)
            }
        }
    }
}

impl fmt::Display for DoseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DoseError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for DoseError {}

impl From<serde_json::Error> for DoseError {
    fn from(err: serde_json::Error) -> Self {
        DoseError::ConfigInvalid {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dose_error_codes() {
        assert_eq!(
            DoseError::InvalidArgument { value: 79.9 }.code(),
            DoseErrorCodes::INVALID_ARGUMENT
        );
        assert_eq!(
            DoseError::LockPoisoned {
                component: "test".to_string()
            }
            .code(),
            DoseErrorCodes::LOCK_POISONED
        );
        assert_eq!(
            DoseError::ProcessorCreationFailed {
                reason: "test".to_string()
            }
            .code(),
            DoseErrorCodes::PROCESSOR_CREATION_FAILED
        );
        assert_eq!(
            DoseError::InterfaceRevoked.code(),
            DoseErrorCodes::INTERFACE_REVOKED
        );
        assert_eq!(
            DoseError::ConfigInvalid {
                reason: "test".to_string()
            }
            .code(),
            DoseErrorCodes::CONFIG_INVALID
        );
    }

    #[test]
    fn test_dose_error_messages() {
        let err = DoseError::InvalidArgument { value: 100.5 };
        assert_eq!(
            err.message(),
            "RS2 must be within [80.0, 100.0] dBA (got 100.5)"
        );

        let err = DoseError::LockPoisoned {
            component: "sound_dose_state".to_string(),
        };
        assert!(err.message().contains("sound_dose_state"));

        let err = DoseError::InterfaceRevoked;
        assert!(err.message().contains("revoked"));
    }

    #[test]
    fn test_dose_error_display() {
        let err = DoseError::InvalidArgument { value: 0.0 };
        let display = format!("{}", err);
        assert!(display.contains("DoseError"));
        assert!(display.contains(&err.code().to_string()));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let dose_err: DoseError = json_err.into();
        assert!(matches!(dose_err, DoseError::ConfigInvalid { .. }));
    }
}
