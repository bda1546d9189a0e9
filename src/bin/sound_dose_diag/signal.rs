use std::f32::consts::TAU;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tone frequency used by the sine source.
const SINE_FREQUENCY_HZ: f32 = 1_000.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Waveform {
    Sine,
    Noise,
}

/// Generates one-second blocks of interleaved float PCM at a target level.
pub struct Synthesizer {
    waveform: Waveform,
    sample_rate: u32,
    channels: usize,
    dbfs_to_dba_offset: f32,
    frame_index: u64,
    rng: StdRng,
}

impl Synthesizer {
    pub fn new(
        waveform: Waveform,
        sample_rate: u32,
        channels: usize,
        dbfs_to_dba_offset: f32,
        seed: u64,
    ) -> Self {
        Self {
            waveform,
            sample_rate,
            channels,
            dbfs_to_dba_offset,
            frame_index: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Peak amplitude per channel so the frame energy lands on `level_dba`.
    fn amplitude(&self, level_dba: f32) -> f32 {
        let frame_energy = 10f32.powf((level_dba - self.dbfs_to_dba_offset) / 10.0);
        // mean of sin^2 is 1/2, of a uniform [-a, a] variable a^2/3
        let crest = match self.waveform {
            Waveform::Sine => 2.0,
            Waveform::Noise => 3.0,
        };
        (crest * frame_energy / self.channels as f32).sqrt().min(1.0)
    }

    pub fn next_second(&mut self, level_dba: f32) -> Vec<u8> {
        let amplitude = self.amplitude(level_dba);
        let frames = self.sample_rate as usize;
        let mut bytes = Vec::with_capacity(frames * self.channels * 4);

        for _ in 0..frames {
            let sample = match self.waveform {
                Waveform::Sine => {
                    let t = self.frame_index as f32 / self.sample_rate as f32;
                    amplitude * (TAU * SINE_FREQUENCY_HZ * t).sin()
                }
                Waveform::Noise => self.rng.gen_range(-amplitude..=amplitude),
            };
            for _ in 0..self.channels {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            self.frame_index = (self.frame_index + 1) % self.sample_rate as u64;
        }
        bytes
    }
}

/// Decoded WAV file as interleaved float samples.
pub struct WavClip {
    pub sample_rate: u32,
    pub channels: usize,
    samples: Vec<f32>,
}

impl WavClip {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("opening WAV file {}", path.display()))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            bail!("{} has an empty WAV header", path.display());
        }

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .context("decoding float WAV samples")?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()
                    .context("decoding integer WAV samples")?
            }
        };

        Ok(Self {
            sample_rate: spec.sample_rate,
            channels: spec.channels as usize,
            samples,
        })
    }

    /// Whole seconds available in the clip.
    pub fn seconds(&self) -> usize {
        self.samples.len() / (self.sample_rate as usize * self.channels)
    }

    /// Float PCM bytes for second `index` of the clip.
    pub fn second(&self, index: usize) -> Vec<u8> {
        let len = self.sample_rate as usize * self.channels;
        let start = (index * len).min(self.samples.len());
        let end = (start + len).min(self.samples.len());
        self.samples[start..end]
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect()
    }
}
