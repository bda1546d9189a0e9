// Sound Dose - cumulative sound dose tracking
// Per-stream MEL computation feeding a rolling 7-day CSD (IEC 62368-1)

// Module declarations
pub mod clock;
pub mod config;
pub mod dose;
pub mod error;
pub mod listener;
pub mod mel;
pub mod types;

#[cfg(feature = "http")]
pub mod http;

// Re-exports for convenience
pub use config::DoseConfig;
pub use dose::{SoundDose, SoundDoseManager};
pub use error::{DoseError, ErrorCode};
pub use listener::{ChannelListener, Delivery, DoseEvent, SoundDoseCallback};
pub use mel::{MelCallback, MelProcessor};
pub use types::{AudioFormat, DeviceId, SoundDoseRecord, StreamHandle};

use tracing_subscriber::EnvFilter;

/// Initialize logging for binaries and ad-hoc tools.
///
/// Honors `RUST_LOG`, defaulting to `info`. `log` records from the library
/// are routed through the same subscriber and written to stderr, so stdout
/// stays free for reports. Calling it twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        log::debug!("[SoundDose] Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
