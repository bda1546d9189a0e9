// Error types for the sound dose tracker
//
// This module defines the error type surfaced by the dose coordinator and its
// control surface, with numeric codes suitable for transport boundaries.

mod dose;

pub use dose::{log_dose_error, DoseError, DoseErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// transport boundaries.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
