//! Listener side of the dose tracker: the callback registered through the
//! control surface, plus a channel-backed implementation for async consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::types::{DeviceId, SoundDoseRecord};

/// Outcome of handing an event to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The listener's connection is gone; the registration should be cleared.
    Disconnected,
}

/// Callback registered by the external listener.
///
/// Invoked from audio processing contexts: implementations must hand events
/// off without blocking. Delivery is best-effort.
pub trait SoundDoseCallback: Send + Sync {
    fn on_momentary_exposure(&self, current_mel: f32, device_id: DeviceId) -> Delivery;

    fn on_new_csd_value(&self, current_csd: f32, records: &[SoundDoseRecord]) -> Delivery;
}

/// Events forwarded by [`ChannelListener`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DoseEvent {
    MomentaryExposure {
        current_mel: f32,
        device_id: DeviceId,
    },
    NewCsdValue {
        current_csd: f32,
        records: Vec<SoundDoseRecord>,
    },
}

/// Events queued for a [`ChannelListener`] consumer before new ones are dropped.
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Listener forwarding events into a bounded tokio channel.
///
/// A full queue drops the event and counts it, so a stalled consumer never
/// grows memory or blocks the audio path. Dropping the receiver is treated
/// as the listener's death.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::Sender<DoseEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::Receiver<DoseEvent>) {
        Self::with_capacity(DEFAULT_LISTENER_CAPACITY)
    }

    /// Listener whose queue holds at most `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<DoseEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Events discarded because the consumer fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: DoseEvent) -> Delivery {
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "[ChannelListener] Queue full, dropped event ({} so far)",
                    dropped
                );
                Delivery::Delivered
            }
            Err(TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }
}

impl SoundDoseCallback for ChannelListener {
    fn on_momentary_exposure(&self, current_mel: f32, device_id: DeviceId) -> Delivery {
        self.send(DoseEvent::MomentaryExposure {
            current_mel,
            device_id,
        })
    }

    fn on_new_csd_value(&self, current_csd: f32, records: &[SoundDoseRecord]) -> Delivery {
        self.send(DoseEvent::NewCsdValue {
            current_csd,
            records: records.to_vec(),
        })
    }
}
