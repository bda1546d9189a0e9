// ProcessorRegistry - stream handle → MEL processor lookup
//
// The audio pipeline owns every processor; the registry only keeps weak
// references so a stream torn down without a matching remove() never leaves
// a zombie processor alive. Dead entries are purged lazily on lookup and
// swept whenever a new entry is inserted or the live size is queried.
//
// The registry has no lock of its own: it lives inside the coordinator's
// state mutex, which also serializes creation for the same stream handle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::debug;

use crate::error::DoseError;
use crate::mel::MelProcessor;
use crate::types::StreamHandle;

#[derive(Default)]
pub struct ProcessorRegistry {
    entries: HashMap<StreamHandle, Weak<MelProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live processor for `stream`, or build one with `create`.
    ///
    /// An existing live processor is returned as is: a stream's format is
    /// fixed when its processor is created. If `create` fails the registry is
    /// left unchanged.
    pub fn get_or_create<F>(
        &mut self,
        stream: StreamHandle,
        create: F,
    ) -> Result<Arc<MelProcessor>, DoseError>
    where
        F: FnOnce() -> Result<MelProcessor, DoseError>,
    {
        if let Some(processor) = self.get(stream) {
            return Ok(processor);
        }

        let processor = Arc::new(create()?);
        self.purge_dead();
        self.entries.insert(stream, Arc::downgrade(&processor));
        debug!(
            "[ProcessorRegistry] Registered processor #{} for {}",
            processor.instance_id(),
            stream
        );
        Ok(processor)
    }

    /// Live processor for `stream`, purging the entry if its target is gone.
    pub fn get(&mut self, stream: StreamHandle) -> Option<Arc<MelProcessor>> {
        let weak = self.entries.get(&stream)?;
        match weak.upgrade() {
            Some(processor) => Some(processor),
            None => {
                debug!("[ProcessorRegistry] Purging stale entry for {}", stream);
                self.entries.remove(&stream);
                None
            }
        }
    }

    /// Drop the entry for `stream`. Unknown handles are a no-op.
    ///
    /// Returns whether an entry existed.
    pub fn remove(&mut self, stream: StreamHandle) -> bool {
        self.entries.remove(&stream).is_some()
    }

    /// Every live processor; dead entries are purged on the way.
    pub fn live_processors(&mut self) -> Vec<Arc<MelProcessor>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|_, weak| match weak.upgrade() {
            Some(processor) => {
                live.push(processor);
                true
            }
            None => false,
        });
        live
    }

    /// Number of entries whose processor is still alive.
    pub fn live_len(&mut self) -> usize {
        self.purge_dead();
        self.entries.len()
    }

    /// Number of stored entries, dead ones included.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Erase every entry whose processor was destroyed. Returns how many.
    pub fn purge_dead(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }
}
