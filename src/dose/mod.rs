//! Sound dose coordination: processor registry, dose state and the
//! listener's control surface.

pub mod conversion;
pub mod interface;
pub mod manager;
pub mod registry;

pub use conversion::{csd_record_to_sound_dose_record, sound_dose_record_to_csd_record};
pub use interface::SoundDose;
pub use manager::SoundDoseManager;
pub use registry::ProcessorRegistry;
