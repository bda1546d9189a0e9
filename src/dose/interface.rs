// SoundDose - control surface handed to the registered listener
//
// Bound to one listener registration. Once another listener registers, or
// this one dies, every operation fails with InterfaceRevoked. The surface
// holds the coordinator weakly and never keeps it alive.

use std::sync::{Arc, Weak};

use log::{debug, info};

use crate::dose::manager::SoundDoseManager;
use crate::error::{log_dose_error, DoseError};
use crate::types::SoundDoseRecord;

pub struct SoundDose {
    manager: Weak<SoundDoseManager>,
    registration_id: u64,
}

impl SoundDose {
    pub(crate) fn new(manager: Weak<SoundDoseManager>, registration_id: u64) -> Self {
        Self {
            manager,
            registration_id,
        }
    }

    pub fn registration_id(&self) -> u64 {
        self.registration_id
    }

    /// Whether this surface still belongs to the registered listener.
    pub fn is_active(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| manager.is_registration_current(self.registration_id))
    }

    /// Set the RS2 threshold in dBA. Accepted range is [80, 100].
    pub fn set_output_rs2(&self, rs2_value: f32) -> Result<(), DoseError> {
        self.active_manager("set_output_rs2")?
            .set_output_rs2(rs2_value)
    }

    pub fn get_output_rs2(&self) -> Result<f32, DoseError> {
        self.active_manager("get_output_rs2")?.output_rs2()
    }

    /// Current cumulative sound dose; 1.0 is 100%.
    pub fn get_csd(&self) -> Result<f32, DoseError> {
        Ok(self.active_manager("get_csd")?.current_csd())
    }

    /// Dose records retained in the rolling window, oldest first.
    pub fn get_records(&self) -> Result<Vec<SoundDoseRecord>, DoseError> {
        Ok(self.active_manager("get_records")?.snapshot().1)
    }

    /// Replace the tracked dose, e.g. with state persisted across reboots.
    pub fn reset_csd(&self, current_csd: f32, records: &[SoundDoseRecord]) -> Result<(), DoseError> {
        self.active_manager("reset_csd")?
            .reset_csd(current_csd, records);
        Ok(())
    }

    /// Test hook: toggle framework MEL computation.
    pub fn force_use_framework_mel(&self, use_framework_mel: bool) -> Result<(), DoseError> {
        self.active_manager("force_use_framework_mel")?
            .set_use_framework_mel(use_framework_mel)
    }

    /// Test hook: count exposure on every device instead of the loudest.
    pub fn force_compute_csd_on_all_devices(&self, all_devices: bool) -> Result<(), DoseError> {
        self.active_manager("force_compute_csd_on_all_devices")?
            .set_compute_csd_on_all_devices(all_devices)
    }

    /// The listener behind this surface died.
    ///
    /// Clears the registration only if it is still the current one.
    pub fn on_disconnected(&self) {
        match self.manager.upgrade() {
            Some(manager) => {
                if !manager.clear_listener(self.registration_id) {
                    debug!(
                        "[SoundDose] Stale registration #{} disconnected, ignoring",
                        self.registration_id
                    );
                }
            }
            None => info!(
                "[SoundDose] Registration #{} disconnected after manager shutdown",
                self.registration_id
            ),
        }
    }

    fn active_manager(&self, operation: &str) -> Result<Arc<SoundDoseManager>, DoseError> {
        match self.manager.upgrade() {
            Some(manager) if manager.is_registration_current(self.registration_id) => Ok(manager),
            _ => {
                let err = DoseError::InterfaceRevoked;
                log_dose_error(&err, operation);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Delivery, SoundDoseCallback};
    use crate::types::DeviceId;

    struct NullListener;

    impl SoundDoseCallback for NullListener {
        fn on_momentary_exposure(&self, _: f32, _: DeviceId) -> Delivery {
            Delivery::Delivered
        }

        fn on_new_csd_value(&self, _: f32, _: &[SoundDoseRecord]) -> Delivery {
            Delivery::Delivered
        }
    }

    #[test]
    fn test_surface_controls_manager() {
        let manager = SoundDoseManager::new();
        let surface = manager.get_sound_dose_interface(Arc::new(NullListener)).unwrap();

        assert!(surface.is_active());
        surface.set_output_rs2(90.0).unwrap();
        assert_eq!(surface.get_output_rs2().unwrap(), 90.0);
        assert_eq!(manager.output_rs2().unwrap(), 90.0);

        assert!(matches!(
            surface.set_output_rs2(101.0),
            Err(DoseError::InvalidArgument { .. })
        ));

        surface.force_compute_csd_on_all_devices(true).unwrap();
        assert!(manager.compute_csd_on_all_devices());
        surface.force_use_framework_mel(false).unwrap();
        assert!(!manager.use_framework_mel());
    }

    #[test]
    fn test_reset_and_read_back() {
        let manager = SoundDoseManager::new();
        let surface = manager.get_sound_dose_interface(Arc::new(NullListener)).unwrap();
        assert_eq!(surface.get_csd().unwrap(), 0.0);
        assert!(surface.get_records().unwrap().is_empty());

        surface.reset_csd(0.5, &[]).unwrap();
        assert_eq!(surface.get_csd().unwrap(), 0.5);
    }

    #[test]
    fn test_replaced_surface_is_revoked() {
        let manager = SoundDoseManager::new();
        let old = manager.get_sound_dose_interface(Arc::new(NullListener)).unwrap();
        let new = manager.get_sound_dose_interface(Arc::new(NullListener)).unwrap();

        assert!(!old.is_active());
        assert_eq!(old.set_output_rs2(90.0), Err(DoseError::InterfaceRevoked));
        assert_eq!(old.get_csd(), Err(DoseError::InterfaceRevoked));

        // A stale death must not clear the new registration
        old.on_disconnected();
        assert!(new.is_active());
        assert!(manager.has_listener());

        new.on_disconnected();
        assert!(!new.is_active());
        assert!(!manager.has_listener());
    }

    #[test]
    fn test_surface_outliving_manager_is_revoked() {
        let manager = SoundDoseManager::new();
        let surface = manager.get_sound_dose_interface(Arc::new(NullListener)).unwrap();
        drop(manager);

        assert!(!surface.is_active());
        assert_eq!(surface.get_output_rs2(), Err(DoseError::InterfaceRevoked));
        surface.on_disconnected();
    }
}
