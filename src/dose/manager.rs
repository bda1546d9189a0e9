// SoundDoseManager: cumulative sound dose coordinator
//
// Single point of policy between the MEL processors of every active stream
// and the one listener whose dose is being tracked:
// - owns the processor registry, the RS2 threshold and the listener slot,
//   all guarded by one mutex with short critical sections
// - owns the rolling MEL aggregator, which synchronizes internally and is
//   never called while the coordinator lock is held
// - is the MelCallback target of every processor it creates
//
// Listener callbacks always run with no lock held.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{validate_rs2, DoseConfig};
use crate::dose::conversion::{csd_record_to_sound_dose_record, sound_dose_record_to_csd_record};
use crate::dose::interface::SoundDose;
use crate::dose::registry::ProcessorRegistry;
use crate::error::{log_dose_error, DoseError};
use crate::listener::{Delivery, SoundDoseCallback};
use crate::mel::{DoseAccounting, MelAggregator, MelCallback, MelProcessor, MelProcessorParams};
use crate::types::{AudioFormat, DeviceId, MelRecord, SoundDoseRecord, StreamHandle};

/// Currently registered listener
#[derive(Clone)]
struct ListenerRegistration {
    id: u64,
    callback: Arc<dyn SoundDoseCallback>,
}

/// State guarded by the coordinator lock
struct ManagerState {
    registry: ProcessorRegistry,
    rs2_value: f32,
    listener: Option<ListenerRegistration>,
    use_framework_mel: bool,
    compute_csd_on_all_devices: bool,
}

impl ManagerState {
    fn accounting(&self) -> DoseAccounting {
        if self.compute_csd_on_all_devices {
            DoseAccounting::AllDevices
        } else {
            DoseAccounting::LoudestDevice
        }
    }
}

/// Tracks the cumulative sound dose of one listener across all streams.
///
/// # Example
/// ```ignore
/// let manager = SoundDoseManager::new();
/// let processor = manager
///     .get_or_create_processor_for_device(DeviceId(3), StreamHandle(42), 48_000, 2, AudioFormat::PcmFloat)?
///     .expect("framework MEL enabled");
/// processor.process(&pcm);
/// let (csd, records) = manager.snapshot();
/// ```
pub struct SoundDoseManager {
    self_ref: Weak<SoundDoseManager>,
    aggregator: MelAggregator,
    dbfs_to_dba_offset: f32,
    clock: Arc<dyn Clock>,
    next_registration_id: AtomicU64,
    state: Mutex<ManagerState>,
}

impl SoundDoseManager {
    /// Create a manager with the default configuration and system clock.
    pub fn new() -> Arc<Self> {
        Self::with_config(&DoseConfig::default())
    }

    pub fn with_config(config: &DoseConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager driven by `clock`.
    ///
    /// An RS2 value outside [80, 100] in `config` is replaced by the default.
    pub fn with_clock(config: &DoseConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let rs2_value = validate_rs2(config.rs2_value).unwrap_or_else(|err| {
            log_dose_error(&err, "with_config");
            crate::config::DEFAULT_RS2_VALUE
        });

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            aggregator: MelAggregator::new(config.csd_window_secs, clock.clone()),
            dbfs_to_dba_offset: config.processor.dbfs_to_dba_offset,
            clock,
            next_registration_id: AtomicU64::new(1),
            state: Mutex::new(ManagerState {
                registry: ProcessorRegistry::new(),
                rs2_value,
                listener: None,
                use_framework_mel: config.use_framework_mel,
                compute_csd_on_all_devices: config.compute_csd_on_all_devices,
            }),
        })
    }

    // ========================================================================
    // PROCESSOR REGISTRY
    // ========================================================================

    /// Create or get the MEL processor assigned to `stream`.
    ///
    /// A live processor is returned unchanged whatever the new parameters.
    /// Returns `Ok(None)` when framework MEL computation is disabled and the
    /// audio pipeline gets its MEL values elsewhere.
    ///
    /// # Errors
    /// - `ProcessorCreationFailed` for a zero sample rate or channel count
    /// - `LockPoisoned`
    pub fn get_or_create_processor_for_device(
        &self,
        device_id: DeviceId,
        stream: StreamHandle,
        sample_rate: u32,
        channel_count: usize,
        format: AudioFormat,
    ) -> Result<Option<Arc<MelProcessor>>, DoseError> {
        let mut state = self.lock_state()?;
        if !state.use_framework_mel {
            debug!(
                "[SoundDoseManager] Framework MEL disabled, no processor for {}",
                stream
            );
            return Ok(None);
        }

        let rs2_value = state.rs2_value;
        let params = MelProcessorParams {
            stream,
            device_id,
            sample_rate,
            channel_count,
            format,
            dbfs_to_dba_offset: self.dbfs_to_dba_offset,
        };

        state
            .registry
            .get_or_create(stream, || {
                let callback: Arc<dyn MelCallback> =
                    self.self_ref
                        .upgrade()
                        .ok_or_else(|| DoseError::ProcessorCreationFailed {
                            reason: "sound dose manager is shutting down".to_string(),
                        })?;
                MelProcessor::new(params, callback, rs2_value)
            })
            .map(Some)
            .map_err(|err| {
                log_dose_error(&err, "get_or_create_processor_for_device");
                err
            })
    }

    /// Forget the processor of a closed stream. Unknown handles are a no-op.
    pub fn remove_stream_processor(&self, stream: StreamHandle) {
        match self.lock_state() {
            Ok(mut state) => {
                if state.registry.remove(stream) {
                    debug!("[SoundDoseManager] Removed processor for {}", stream);
                }
            }
            Err(err) => log_dose_error(&err, "remove_stream_processor"),
        }
    }

    /// Live processor registered for `stream`, if any.
    pub fn processor_for_stream(&self, stream: StreamHandle) -> Option<Arc<MelProcessor>> {
        self.lock_state().ok()?.registry.get(stream)
    }

    /// Number of streams whose processor is still alive.
    pub fn active_processor_count(&self) -> usize {
        self.lock_state()
            .map(|mut state| state.registry.live_len())
            .unwrap_or(0)
    }

    // ========================================================================
    // THRESHOLD AND MODES
    // ========================================================================

    /// Set the RS2 value used for momentary exposure warnings.
    ///
    /// Live processors pick the value up for their next comparison.
    ///
    /// # Errors
    /// `InvalidArgument` outside [80, 100] dBA; the prior value is kept.
    pub fn set_output_rs2(&self, rs2_value: f32) -> Result<(), DoseError> {
        validate_rs2(rs2_value).map_err(|err| {
            log_dose_error(&err, "set_output_rs2");
            err
        })?;

        let mut state = self.lock_state()?;
        state.rs2_value = rs2_value;
        for processor in state.registry.live_processors() {
            processor.set_output_rs2(rs2_value);
        }
        info!("[SoundDoseManager] RS2 set to {} dBA", rs2_value);
        Ok(())
    }

    pub fn output_rs2(&self) -> Result<f32, DoseError> {
        Ok(self.lock_state()?.rs2_value)
    }

    pub fn set_use_framework_mel(&self, use_framework_mel: bool) -> Result<(), DoseError> {
        self.lock_state()?.use_framework_mel = use_framework_mel;
        info!(
            "[SoundDoseManager] Framework MEL computation {}",
            if use_framework_mel { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn use_framework_mel(&self) -> bool {
        self.lock_state()
            .map(|state| state.use_framework_mel)
            .unwrap_or(false)
    }

    pub fn set_compute_csd_on_all_devices(&self, all_devices: bool) -> Result<(), DoseError> {
        self.lock_state()?.compute_csd_on_all_devices = all_devices;
        info!(
            "[SoundDoseManager] CSD accounting: {:?}",
            if all_devices {
                DoseAccounting::AllDevices
            } else {
                DoseAccounting::LoudestDevice
            }
        );
        Ok(())
    }

    pub fn compute_csd_on_all_devices(&self) -> bool {
        self.lock_state()
            .map(|state| state.compute_csd_on_all_devices)
            .unwrap_or(false)
    }

    // ========================================================================
    // DOSE STATE
    // ========================================================================

    pub fn current_csd(&self) -> f32 {
        self.aggregator.current_csd()
    }

    /// Current dose and every record retained in the window, oldest first.
    pub fn snapshot(&self) -> (f32, Vec<SoundDoseRecord>) {
        let (csd, records) = self.aggregator.snapshot();
        (
            csd,
            records.iter().map(csd_record_to_sound_dose_record).collect(),
        )
    }

    /// Replace the dose state with one supplied by the listener.
    pub fn reset_csd(&self, current_csd: f32, records: &[SoundDoseRecord]) {
        info!(
            "[SoundDoseManager] Resetting CSD to {} with {} records",
            current_csd,
            records.len()
        );
        self.aggregator.reset(
            current_csd,
            records.iter().map(sound_dose_record_to_csd_record).collect(),
        );
    }

    pub fn cached_mel_records_size(&self) -> usize {
        self.aggregator.cached_records_size()
    }

    // ========================================================================
    // LISTENER REGISTRATION
    // ========================================================================

    /// Register the listener and get the control surface bound to it.
    ///
    /// Any previously registered listener is replaced and its surface revoked.
    pub fn get_sound_dose_interface(
        &self,
        callback: Arc<dyn SoundDoseCallback>,
    ) -> Result<SoundDose, DoseError> {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .lock_state()?
            .listener
            .replace(ListenerRegistration { id, callback });

        match previous {
            Some(previous) => info!(
                "[SoundDoseManager] Listener #{} replaced by #{}",
                previous.id, id
            ),
            None => info!("[SoundDoseManager] Listener #{} registered", id),
        }
        Ok(SoundDose::new(self.self_ref.clone(), id))
    }

    pub fn has_listener(&self) -> bool {
        self.lock_state()
            .map(|state| state.listener.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn is_registration_current(&self, id: u64) -> bool {
        self.lock_state()
            .map(|state| state.listener.as_ref().map(|l| l.id) == Some(id))
            .unwrap_or(false)
    }

    /// Clear the listener slot if it still holds registration `id`.
    pub(crate) fn clear_listener(&self, id: u64) -> bool {
        match self.lock_state() {
            Ok(mut state) if state.listener.as_ref().map(|l| l.id) == Some(id) => {
                state.listener = None;
                info!("[SoundDoseManager] Listener #{} cleared", id);
                true
            }
            Ok(_) => false,
            Err(err) => {
                log_dose_error(&err, "clear_listener");
                false
            }
        }
    }

    fn current_listener(&self) -> Option<ListenerRegistration> {
        match self.lock_state() {
            Ok(state) => state.listener.clone(),
            Err(err) => {
                log_dose_error(&err, "current_listener");
                None
            }
        }
    }

    fn deliver<F>(&self, listener: ListenerRegistration, send: F)
    where
        F: FnOnce(&dyn SoundDoseCallback) -> Delivery,
    {
        if send(listener.callback.as_ref()) == Delivery::Disconnected {
            warn!(
                "[SoundDoseManager] Listener #{} disconnected while delivering",
                listener.id
            );
            self.clear_listener(listener.id);
        }
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Human-readable state summary for operational inspection.
    pub fn dump(&self) -> String {
        let (rs2, processors, use_framework_mel, all_devices, listener) = match self.lock_state()
        {
            Ok(mut state) => (
                format!("{:.1}", state.rs2_value),
                state.registry.live_len(),
                state.use_framework_mel,
                state.compute_csd_on_all_devices,
                state.listener.as_ref().map(|l| l.id),
            ),
            Err(_) => ("<poisoned>".to_string(), 0, false, false, None),
        };
        let (csd, records) = self.aggregator.snapshot();

        let mut out = String::new();
        let _ = writeln!(out, "Sound Dose Manager:");
        let _ = writeln!(out, "  RS2 value: {} dBA", rs2);
        let _ = writeln!(out, "  Current CSD: {:.6} ({:.2}%)", csd, csd * 100.0);
        let _ = writeln!(out, "  CSD window: {}s", self.aggregator.window_secs());
        let _ = writeln!(out, "  Cached CSD records: {}", records.len());
        let _ = writeln!(out, "  Active processors: {}", processors);
        let _ = writeln!(out, "  Use framework MEL: {}", use_framework_mel);
        let _ = writeln!(out, "  Compute CSD on all devices: {}", all_devices);
        match listener {
            Some(id) => {
                let _ = writeln!(out, "  Listener: #{}", id);
            }
            None => {
                let _ = writeln!(out, "  Listener: none");
            }
        }
        for record in &records {
            let _ = writeln!(
                out,
                "    {} +{}s mel={:.2} dBA value={:.6} csd={:.6}",
                record.timestamp,
                record.duration,
                record.average_mel,
                record.value,
                record.cumulative_dose
            );
        }
        out
    }

    // ========================================================================
    // PRIVATE HELPER METHODS
    // ========================================================================

    /// Safely acquire the coordinator lock
    ///
    /// # Returns
    /// * `Ok(MutexGuard)` - Lock acquired successfully
    /// * `Err(DoseError::LockPoisoned)` - Lock is poisoned
    fn lock_state(&self) -> Result<MutexGuard<'_, ManagerState>, DoseError> {
        self.state.lock().map_err(|_| DoseError::LockPoisoned {
            component: "sound_dose_state".to_string(),
        })
    }
}

impl MelCallback for SoundDoseManager {
    fn on_new_mel_values(&self, mels: &[f32], offset: usize, length: usize, device_id: DeviceId) {
        let end = offset.saturating_add(length).min(mels.len());
        let values = match mels.get(offset..end) {
            Some(values) if !values.is_empty() => values,
            _ => return,
        };

        let accounting = match self.lock_state() {
            Ok(state) => state.accounting(),
            Err(err) => {
                log_dose_error(&err, "on_new_mel_values");
                return;
            }
        };

        // The batch ends now, one value per second
        let start = self.clock.now_secs() - values.len() as i64;
        let mut new_records = Vec::with_capacity(values.len());
        for (index, &mel) in values.iter().enumerate() {
            new_records.extend(
                self.aggregator
                    .insert(MelRecord::new(device_id, start + index as i64, mel), accounting),
            );
        }

        if new_records.is_empty() {
            return;
        }
        if let Some(listener) = self.current_listener() {
            let current_csd = self.aggregator.current_csd();
            let records: Vec<SoundDoseRecord> = new_records
                .iter()
                .map(csd_record_to_sound_dose_record)
                .collect();
            self.deliver(listener, |callback| {
                callback.on_new_csd_value(current_csd, &records)
            });
        }
    }

    fn on_momentary_exposure(&self, current_mel: f32, device_id: DeviceId) {
        match self.current_listener() {
            Some(listener) => {
                debug!(
                    "[SoundDoseManager] Momentary exposure {:.2} dBA on {}",
                    current_mel, device_id
                );
                self.deliver(listener, |callback| {
                    callback.on_momentary_exposure(current_mel, device_id)
                });
            }
            None => debug!(
                "[SoundDoseManager] No listener, dropping momentary exposure {:.2} dBA on {}",
                current_mel, device_id
            ),
        }
    }
}
