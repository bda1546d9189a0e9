// MEL module - momentary exposure level computation and aggregation
//
// A MelProcessor is attached to every active output stream and turns its PCM
// into one momentary exposure level (MEL, dBA) per second. All processors
// report into a single MelAggregator through the MelCallback seam, which the
// dose coordinator implements.

pub mod aggregator;
pub mod processor;

pub use aggregator::{DoseAccounting, MelAggregator, CSD_WINDOW_SECONDS};
pub use processor::{MelProcessor, MelProcessorParams};

use crate::types::DeviceId;

/// Receiver of everything a MEL processor computes.
///
/// Called from the processor's audio context: implementations must not block.
pub trait MelCallback: Send + Sync {
    /// A contiguous run of MEL values, one per second, `mels[offset..offset + length]`.
    fn on_new_mel_values(&self, mels: &[f32], offset: usize, length: usize, device_id: DeviceId);

    /// A single MEL value exceeded the processor's RS2 threshold.
    fn on_momentary_exposure(&self, current_mel: f32, device_id: DeviceId);
}
