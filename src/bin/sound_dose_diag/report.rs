use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::Receiver;

use sound_dose::{DoseEvent, SoundDoseRecord};

#[derive(Debug, Serialize)]
pub struct MomentaryRow {
    pub device_id: i32,
    pub current_mel: f32,
}

/// Outcome of a `simulate` run.
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub streams: usize,
    pub seconds: usize,
    pub rs2: f32,
    pub compute_csd_on_all_devices: bool,
    pub momentary_events: Vec<MomentaryRow>,
    pub csd_updates: usize,
    pub dropped_events: u64,
    pub final_csd: f32,
    pub records: Vec<SoundDoseRecord>,
}

impl SimulationReport {
    /// Fold every pending listener event into the report.
    pub fn drain_events(&mut self, rx: &mut Receiver<DoseEvent>) {
        loop {
            match rx.try_recv() {
                Ok(DoseEvent::MomentaryExposure {
                    current_mel,
                    device_id,
                }) => self.momentary_events.push(MomentaryRow {
                    device_id: device_id.0,
                    current_mel,
                }),
                Ok(DoseEvent::NewCsdValue { .. }) => self.csd_updates += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    pub fn print_json(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing simulation report")?;
        println!("{json}");
        Ok(())
    }

    pub fn print_table(&self, dump: &str) {
        println!(
            "Simulated {} stream(s) for {} s, RS2 {:.1} dBA",
            self.streams, self.seconds, self.rs2
        );
        println!("{:<10} {:>12}", "device", "mel (dBA)");
        for row in &self.momentary_events {
            println!("{:<10} {:>12.2}", row.device_id, row.current_mel);
        }
        println!(
            "{} momentary exposure event(s), {} CSD update(s), final CSD {:.6} ({:.4}%)",
            self.momentary_events.len(),
            self.csd_updates,
            self.final_csd,
            self.final_csd * 100.0
        );
        if self.dropped_events > 0 {
            println!("{} event(s) dropped by the listener queue", self.dropped_events);
        }
        println!();
        print!("{dump}");
    }
}
