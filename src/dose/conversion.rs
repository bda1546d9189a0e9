//! Conversion between aggregator records and the external record format.
//!
//! Both directions are total and lossless: values outside the nominal dBA
//! range pass through untouched so listeners can spot them.

use crate::types::{CsdRecord, SoundDoseRecord};

pub fn csd_record_to_sound_dose_record(record: &CsdRecord) -> SoundDoseRecord {
    SoundDoseRecord {
        timestamp: record.timestamp,
        duration: record.duration,
        value: record.value,
        average_mel: record.average_mel,
        cumulative_dose: record.cumulative_dose,
    }
}

pub fn sound_dose_record_to_csd_record(record: &SoundDoseRecord) -> CsdRecord {
    CsdRecord {
        timestamp: record.timestamp,
        duration: record.duration,
        value: record.value,
        average_mel: record.average_mel,
        cumulative_dose: record.cumulative_dose,
    }
}

impl From<CsdRecord> for SoundDoseRecord {
    fn from(record: CsdRecord) -> Self {
        csd_record_to_sound_dose_record(&record)
    }
}

impl From<SoundDoseRecord> for CsdRecord {
    fn from(record: SoundDoseRecord) -> Self {
        sound_dose_record_to_csd_record(&record)
    }
}
