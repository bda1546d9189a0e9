// MelProcessor - per-stream momentary exposure computation
//
// Accumulates the energy of interleaved PCM frames and emits one MEL value
// per second of audio:
//
//   mel = 10 * log10(mean frame energy) + dBFS→dBA offset + attenuation
//
// where the frame energy is the sum over channels of the squared samples.
// Values strictly above RS2 also raise a momentary exposure event.
//
// Threshold, device and attenuation are atomics so the control plane never
// contends with the audio thread; the energy accumulator has its own mutex
// that only the owning audio thread takes in steady state.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::DoseError;
use crate::mel::MelCallback;
use crate::types::{AudioFormat, DeviceId, StreamHandle};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Floor applied to the mean energy before taking the logarithm (-120 dBFS).
const MIN_MEAN_ENERGY: f64 = 1e-12;

/// Signal parameters fixed at processor construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MelProcessorParams {
    pub stream: StreamHandle,
    pub device_id: DeviceId,
    pub sample_rate: u32,
    pub channel_count: usize,
    pub format: AudioFormat,
    /// Level in dBA produced by a 0 dBFS signal on the listener's ear
    pub dbfs_to_dba_offset: f32,
}

#[derive(Debug, Default)]
struct EnergyAccumulator {
    energy: f64,
    frames: u32,
}

/// Computes MEL values for one stream.
///
/// The audio pipeline owns the processor; the dose coordinator only keeps a
/// weak reference to it.
pub struct MelProcessor {
    instance_id: u64,
    params: MelProcessorParams,
    callback: Arc<dyn MelCallback>,
    device_id: AtomicI32,
    rs2_bits: AtomicU32,
    attenuation_bits: AtomicU32,
    paused: AtomicBool,
    accumulator: Mutex<EnergyAccumulator>,
}

impl MelProcessor {
    /// Create a processor reporting into `callback` with the given RS2.
    ///
    /// # Errors
    /// `ProcessorCreationFailed` when the sample rate or channel count is zero.
    pub fn new(
        params: MelProcessorParams,
        callback: Arc<dyn MelCallback>,
        rs2: f32,
    ) -> Result<Self, DoseError> {
        if params.sample_rate == 0 {
            return Err(DoseError::ProcessorCreationFailed {
                reason: format!("{} has a zero sample rate", params.stream),
            });
        }
        if params.channel_count == 0 {
            return Err(DoseError::ProcessorCreationFailed {
                reason: format!("{} has no channels", params.stream),
            });
        }

        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[MelProcessor] #{} created for {} on {} ({} Hz, {} ch, {:?}, rs2 {})",
            instance_id,
            params.stream,
            params.device_id,
            params.sample_rate,
            params.channel_count,
            params.format,
            rs2
        );

        Ok(Self {
            instance_id,
            params,
            callback,
            device_id: AtomicI32::new(params.device_id.0),
            rs2_bits: AtomicU32::new(rs2.to_bits()),
            attenuation_bits: AtomicU32::new(0f32.to_bits()),
            paused: AtomicBool::new(false),
            accumulator: Mutex::new(EnergyAccumulator::default()),
        })
    }

    /// Process-unique id of this processor instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn stream(&self) -> StreamHandle {
        self.params.stream
    }

    pub fn params(&self) -> MelProcessorParams {
        self.params
    }

    pub fn format(&self) -> AudioFormat {
        self.params.format
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.device_id.load(Ordering::Acquire))
    }

    /// Attribute subsequent values to another device (stream rerouted).
    pub fn set_device_id(&self, device_id: DeviceId) {
        self.device_id.store(device_id.0, Ordering::Release);
    }

    pub fn output_rs2(&self) -> f32 {
        f32::from_bits(self.rs2_bits.load(Ordering::Acquire))
    }

    /// Threshold used for subsequent momentary exposure comparisons.
    pub fn set_output_rs2(&self, rs2: f32) {
        self.rs2_bits.store(rs2.to_bits(), Ordering::Release);
    }

    pub fn attenuation(&self) -> f32 {
        f32::from_bits(self.attenuation_bits.load(Ordering::Acquire))
    }

    /// Gain in dB applied downstream of the tap, usually <= 0.
    pub fn set_attenuation(&self, attenuation_db: f32) {
        self.attenuation_bits
            .store(attenuation_db.to_bits(), Ordering::Release);
    }

    /// Stop consuming input; the partially accumulated second is kept.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Consume interleaved PCM in the processor's format.
    ///
    /// Trailing bytes that do not form a whole frame are ignored. Returns the
    /// number of MEL values completed by this buffer.
    pub fn process(&self, bytes: &[u8]) -> usize {
        if self.is_paused() {
            return 0;
        }

        let sample_bytes = self.params.format.bytes_per_sample();
        let frame_bytes = sample_bytes * self.params.channel_count;
        let mut mels = Vec::new();

        {
            let mut acc = self.accumulator.lock().unwrap_or_else(|poisoned| {
                warn!(
                    "[MelProcessor] #{} accumulator lock poisoned, recovering",
                    self.instance_id
                );
                poisoned.into_inner()
            });

            for frame in bytes.chunks_exact(frame_bytes) {
                acc.energy += frame
                    .chunks_exact(sample_bytes)
                    .map(|sample| {
                        let value = self.params.format.decode(sample) as f64;
                        value * value
                    })
                    .sum::<f64>();
                acc.frames += 1;

                if acc.frames == self.params.sample_rate {
                    mels.push(self.energy_to_mel(acc.energy / acc.frames as f64));
                    *acc = EnergyAccumulator::default();
                }
            }
        }

        if !mels.is_empty() {
            self.report(&mels);
        }
        mels.len()
    }

    fn report(&self, mels: &[f32]) {
        let device_id = self.device_id();
        self.callback
            .on_new_mel_values(mels, 0, mels.len(), device_id);

        let rs2 = self.output_rs2();
        for &mel in mels.iter().filter(|&&mel| mel > rs2) {
            self.callback.on_momentary_exposure(mel, device_id);
        }
    }

    // TODO: apply the IEC 61672 A-weighting filter before accumulating energy
    fn energy_to_mel(&self, mean_energy: f64) -> f32 {
        let dbfs = 10.0 * mean_energy.max(MIN_MEAN_ENERGY).log10();
        dbfs as f32 + self.params.dbfs_to_dba_offset + self.attenuation()
    }
}

impl Drop for MelProcessor {
    fn drop(&mut self) {
        debug!(
            "[MelProcessor] #{} released for {}",
            self.instance_id, self.params.stream
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingCallback {
        mels: Mutex<Vec<(f32, DeviceId)>>,
        momentary: Mutex<Vec<(f32, DeviceId)>>,
    }

    impl MelCallback for RecordingCallback {
        fn on_new_mel_values(&self, mels: &[f32], offset: usize, length: usize, device_id: DeviceId) {
            let mut guard = self.mels.lock().unwrap();
            for mel in &mels[offset..offset + length] {
                guard.push((*mel, device_id));
            }
        }

        fn on_momentary_exposure(&self, current_mel: f32, device_id: DeviceId) {
            self.momentary.lock().unwrap().push((current_mel, device_id));
        }
    }

    const SAMPLE_RATE: u32 = 1_000;
    const OFFSET: f32 = 110.0;

    fn params(channel_count: usize, format: AudioFormat) -> MelProcessorParams {
        MelProcessorParams {
            stream: StreamHandle(7),
            device_id: DeviceId(2),
            sample_rate: SAMPLE_RATE,
            channel_count,
            format,
            dbfs_to_dba_offset: OFFSET,
        }
    }

    /// One second of constant-amplitude float PCM producing `mel` dBA.
    fn second_at(mel: f32, channels: usize) -> Vec<u8> {
        let energy = 10f64.powf((mel - OFFSET) as f64 / 10.0) / channels as f64;
        let amplitude = energy.sqrt() as f32;
        (0..SAMPLE_RATE as usize * channels)
            .flat_map(|_| amplitude.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_rejects_invalid_params() {
        let callback = Arc::new(RecordingCallback::default());
        let mut bad = params(2, AudioFormat::PcmFloat);
        bad.sample_rate = 0;
        assert!(matches!(
            MelProcessor::new(bad, callback.clone(), 100.0),
            Err(DoseError::ProcessorCreationFailed { .. })
        ));

        let mut bad = params(2, AudioFormat::PcmFloat);
        bad.channel_count = 0;
        assert!(MelProcessor::new(bad, callback, 100.0).is_err());
    }

    #[test]
    fn test_emits_one_mel_per_second() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(2, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();

        let pcm = second_at(90.0, 2);
        // Half a second produces nothing yet
        assert_eq!(processor.process(&pcm[..pcm.len() / 2]), 0);
        assert_eq!(processor.process(&pcm[pcm.len() / 2..]), 1);

        let mels = callback.mels.lock().unwrap();
        assert_eq!(mels.len(), 1);
        assert!((mels[0].0 - 90.0).abs() < 0.01);
        assert_eq!(mels[0].1, DeviceId(2));
        assert!(callback.momentary.lock().unwrap().is_empty());
    }

    #[test]
    fn test_momentary_exposure_above_rs2() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(1, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();

        let mut pcm = second_at(70.0, 1);
        pcm.extend(second_at(95.0, 1));
        pcm.extend(second_at(101.0, 1));
        assert_eq!(processor.process(&pcm), 3);

        let momentary = callback.momentary.lock().unwrap();
        assert_eq!(momentary.len(), 1);
        assert!((momentary[0].0 - 101.0).abs() < 0.01);
    }

    #[test]
    fn test_threshold_update_applies_to_next_values() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(1, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();

        processor.process(&second_at(90.0, 1));
        assert!(callback.momentary.lock().unwrap().is_empty());

        processor.set_output_rs2(85.0);
        assert_eq!(processor.output_rs2(), 85.0);
        processor.process(&second_at(90.0, 1));
        assert_eq!(callback.momentary.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rerouting_and_attenuation() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(1, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();

        processor.set_device_id(DeviceId(9));
        processor.set_attenuation(-10.0);
        processor.process(&second_at(90.0, 1));

        let mels = callback.mels.lock().unwrap();
        assert_eq!(mels[0].1, DeviceId(9));
        assert!((mels[0].0 - 80.0).abs() < 0.01);
    }

    #[test]
    fn test_paused_processor_drops_input() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(1, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();

        processor.pause();
        assert_eq!(processor.process(&second_at(90.0, 1)), 0);
        processor.resume();
        assert_eq!(processor.process(&second_at(90.0, 1)), 1);
    }

    #[test]
    fn test_silence_is_floored() {
        let callback = Arc::new(RecordingCallback::default());
        let processor =
            MelProcessor::new(params(1, AudioFormat::PcmI16), callback.clone(), 100.0).unwrap();
        assert_eq!(processor.format(), AudioFormat::PcmI16);

        let silence = vec![0u8; SAMPLE_RATE as usize * 2];
        assert_eq!(processor.process(&silence), 1);
        let mels = callback.mels.lock().unwrap();
        assert!((mels[0].0 - (OFFSET - 120.0)).abs() < 0.01);
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let callback = Arc::new(RecordingCallback::default());
        let a = MelProcessor::new(params(1, AudioFormat::PcmFloat), callback.clone(), 100.0).unwrap();
        let b = MelProcessor::new(params(1, AudioFormat::PcmFloat), callback, 100.0).unwrap();
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
