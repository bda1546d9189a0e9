// MelAggregator - rolling-window cumulative sound dose
//
// Collects momentary exposure records from every MEL processor and keeps the
// cumulative sound dose (CSD) over a fixed window, 7 days by default.
//
// Dose arithmetic follows IEC 62368-1 / EN 50332-3: 100% CSD corresponds to
// 40 hours at 80 dBA, every +3 dB halves the allowed time (100 dBA → 24 min).
//
// Records are bucketed into one-second slots keyed by their timestamp. When
// several devices report on the same slot the slot level is combined using
// the accounting mode picked by the coordinator. Restored records may span
// several seconds; measurements that fall inside such a span are already
// counted by it and are skipped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::clock::Clock;
use crate::types::{CsdRecord, DeviceId, MelRecord};

/// CSD is computed with a rolling window of 7 days.
pub const CSD_WINDOW_SECONDS: i64 = 604_800;

/// Exposure level at which 40 hours amount to 100% CSD.
pub const REFERENCE_MEL_DBA: f32 = 80.0;

/// 40 hours in seconds.
const REFERENCE_DURATION_SECS: f32 = 144_000.0;

/// Relative size below which a dose left with no records is rounding.
const RESIDUAL_TOLERANCE: f64 = 1e-9;

/// How simultaneous records from distinct devices are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseAccounting {
    /// Only the loudest device counts for a given second.
    LoudestDevice,
    /// Every device counts; levels are combined by energy sum.
    AllDevices,
}

/// Dose contributed by `duration_secs` seconds at `mel` dBA.
pub fn mel_to_dose(mel: f32, duration_secs: i32) -> f32 {
    duration_secs as f32 * 10f32.powf((mel - REFERENCE_MEL_DBA) / 10.0) / REFERENCE_DURATION_SECS
}

/// Energy sum of two levels in dB.
pub fn energy_sum_db(a: f32, b: f32) -> f32 {
    10.0 * (10f32.powf(a / 10.0) + 10f32.powf(b / 10.0)).log10()
}

#[derive(Debug, Clone)]
struct Slot {
    record: CsdRecord,
    device_mels: Vec<(DeviceId, f32)>,
}

impl Slot {
    fn combined_mel(&self, accounting: DoseAccounting) -> f32 {
        let mut levels = self.device_mels.iter().map(|(_, mel)| *mel);
        let first = levels.next().unwrap_or(f32::NEG_INFINITY);
        match accounting {
            DoseAccounting::LoudestDevice => levels.fold(first, f32::max),
            DoseAccounting::AllDevices => levels.fold(first, energy_sum_db),
        }
    }
}

/// Slot key: start timestamp, then arrival order among restored records
/// sharing that timestamp. Measured slots always use sequence 0.
type SlotKey = (i64, u32);

#[derive(Debug)]
struct AggregatorState {
    slots: BTreeMap<SlotKey, Slot>,
    /// Kept in f64 so a week of per-second updates does not drift
    current_csd: f64,
    /// Longest duration among stored records, bounds the overlap scan
    max_duration: i64,
}

impl Default for AggregatorState {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
            current_csd: 0.0,
            max_duration: 1,
        }
    }
}

impl AggregatorState {
    /// Start of a stored multi-second record covering `timestamp`, if any.
    fn covering_span(&self, timestamp: i64) -> Option<i64> {
        let from = (timestamp - self.max_duration + 1, 0);
        self.slots
            .range(from..=(timestamp, u32::MAX))
            .map(|(_, slot)| &slot.record)
            .find(|record| {
                record.duration > 1 && timestamp < record.timestamp + record.duration as i64
            })
            .map(|record| record.timestamp)
    }
}

/// Thread-safe rolling CSD aggregator shared by all processors.
pub struct MelAggregator {
    window_secs: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<AggregatorState>,
}

impl MelAggregator {
    pub fn new(window_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs,
            clock,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Insert one exposure record.
    ///
    /// Returns the CSD records created or updated by this insertion. Records
    /// already outside the window and NaN values are ignored. A second record
    /// from the same device on the same slot keeps the louder value.
    ///
    /// A record falling inside a restored multi-second record is already
    /// accounted for by that record and is ignored.
    pub fn insert(&self, record: MelRecord, accounting: DoseAccounting) -> Vec<CsdRecord> {
        if record.value.is_nan() {
            warn!(
                "[MelAggregator] Dropping NaN exposure value from {}",
                record.device_id
            );
            return Vec::new();
        }

        let now = self.clock.now_secs();
        let mut state = self.lock_state();
        self.trim(&mut state, now);

        if record.timestamp < now - self.window_secs {
            debug!(
                "[MelAggregator] Ignoring expired record at {} (now {})",
                record.timestamp, now
            );
            return Vec::new();
        }
        if let Some(span_start) = state.covering_span(record.timestamp) {
            debug!(
                "[MelAggregator] Record at {} overlaps restored span starting {}, ignoring",
                record.timestamp, span_start
            );
            return Vec::new();
        }

        let AggregatorState {
            slots, current_csd, ..
        } = &mut *state;
        let slot = slots
            .entry((record.timestamp, 0))
            .or_insert_with(|| Slot {
                record: CsdRecord {
                    timestamp: record.timestamp,
                    duration: 1,
                    value: 0.0,
                    average_mel: record.value,
                    cumulative_dose: 0.0,
                },
                device_mels: Vec::with_capacity(1),
            });

        match slot
            .device_mels
            .iter_mut()
            .find(|(device, _)| *device == record.device_id)
        {
            Some((_, mel)) => *mel = mel.max(record.value),
            None => slot.device_mels.push((record.device_id, record.value)),
        }

        let average_mel = slot.combined_mel(accounting);
        let value = mel_to_dose(average_mel, slot.record.duration);
        *current_csd = (*current_csd + value as f64 - slot.record.value as f64).max(0.0);

        slot.record.average_mel = average_mel;
        slot.record.value = value;
        slot.record.cumulative_dose = *current_csd as f32;

        vec![slot.record]
    }

    /// Current cumulative dose within the window.
    pub fn current_csd(&self) -> f32 {
        let now = self.clock.now_secs();
        let mut state = self.lock_state();
        self.trim(&mut state, now);
        state.current_csd as f32
    }

    /// Every record retained within the window, ordered by timestamp.
    pub fn records_within_window(&self) -> Vec<CsdRecord> {
        let now = self.clock.now_secs();
        let mut state = self.lock_state();
        self.trim(&mut state, now);
        state.slots.values().map(|slot| slot.record).collect()
    }

    /// Dose and records in one consistent read.
    pub fn snapshot(&self) -> (f32, Vec<CsdRecord>) {
        let now = self.clock.now_secs();
        let mut state = self.lock_state();
        self.trim(&mut state, now);
        let records = state.slots.values().map(|slot| slot.record).collect();
        (state.current_csd as f32, records)
    }

    /// Discard all state and restart from an external dose and record list.
    ///
    /// Records are stored verbatim, including several sharing a timestamp,
    /// and read back in timestamp order then supplied order. Anything
    /// already outside the window is trimmed immediately and its value
    /// leaves the dose.
    pub fn reset(&self, current_csd: f32, records: Vec<CsdRecord>) {
        let now = self.clock.now_secs();
        let mut state = self.lock_state();

        *state = AggregatorState {
            current_csd: current_csd as f64,
            ..AggregatorState::default()
        };
        for record in records {
            let sequence = state
                .slots
                .range((record.timestamp, 0)..=(record.timestamp, u32::MAX))
                .count() as u32;
            state.max_duration = state.max_duration.max(record.duration as i64);
            state.slots.insert(
                (record.timestamp, sequence),
                Slot {
                    record,
                    device_mels: vec![(DeviceId::NONE, record.average_mel)],
                },
            );
        }

        self.trim(&mut state, now);
    }

    pub fn cached_records_size(&self) -> usize {
        self.lock_state().slots.len()
    }

    /// Drop slots that started before `now - window`.
    ///
    /// A slot starting exactly at the boundary is kept. Once the last slot
    /// goes, rounding left over from the running total is cleared.
    fn trim(&self, state: &mut AggregatorState, now: i64) {
        let cutoff = now - self.window_secs;
        let expired: Vec<SlotKey> = state.slots.range(..(cutoff, 0)).map(|(key, _)| *key).collect();
        if expired.is_empty() {
            return;
        }

        let mut removed = 0.0_f64;
        for key in &expired {
            if let Some(slot) = state.slots.remove(key) {
                removed += slot.record.value as f64;
                state.current_csd = (state.current_csd - slot.record.value as f64).max(0.0);
            }
        }
        if state.slots.is_empty() {
            if state.current_csd <= removed * RESIDUAL_TOLERANCE {
                state.current_csd = 0.0;
            }
            state.max_duration = 1;
        }
        debug!(
            "[MelAggregator] Trimmed {} expired records, csd now {:.6}",
            expired.len(),
            state.current_csd
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("[MelAggregator] State lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
