//! Gapless playback scheduling for inbound audio chunks.
//!
//! Every chunk is placed at `max(next_start_time, clock)` and advances
//! `next_start_time` by its duration, so chunks that arrive faster than real
//! time queue back to back while late ones start immediately instead of
//! accumulating drift.
//!
//! Decoding may happen off the dispatch loop. A [`DecodeTicket`] taken at
//! enqueue time fixes the chunk's position in the queue; finished decodes wait
//! in a reorder buffer and are committed strictly in ticket order. Every
//! [`interrupt`](PlaybackScheduler::interrupt) starts a new epoch, and tickets
//! from an older epoch are discarded when they come back.

use crate::codec::{decode_chunk, DecodedAudioBuffer};
use crate::error::{DecodeError, DeviceError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type SourceId = u64;

/// An output device with its own clock (seconds since it was opened).
pub trait OutputDevice: Send {
    fn current_time(&self) -> f64;

    /// Begin playing `buffer` at `start_time` on the device clock.
    fn start(
        &mut self,
        id: SourceId,
        buffer: Arc<DecodedAudioBuffer>,
        start_time: f64,
    ) -> Result<(), DeviceError>;

    /// Silence a source immediately. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// A buffer committed to the device.
#[derive(Debug, Clone)]
pub struct PlaybackSource {
    pub id: SourceId,
    pub buffer: Arc<DecodedAudioBuffer>,
    pub start_time: f64,
    pub created_at: f64,
}

impl PlaybackSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.buffer.duration()
    }
}

/// Queue position reserved for a chunk whose decode is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTicket {
    epoch: u64,
    seq: u64,
}

pub struct PlaybackScheduler {
    device: Option<Box<dyn OutputDevice>>,
    sample_rate: u32,
    active: BTreeMap<SourceId, PlaybackSource>,
    next_start_time: f64,
    next_source_id: SourceId,
    epoch: u64,
    /// Next ticket to hand out.
    issued_seq: u64,
    /// Next ticket allowed to commit.
    commit_seq: u64,
    /// Decoded (or failed) chunks waiting for earlier tickets.
    ready: BTreeMap<u64, Option<DecodedAudioBuffer>>,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>, sample_rate: u32) -> Self {
        Self {
            device: Some(device),
            sample_rate,
            active: BTreeMap::new(),
            next_start_time: 0.0,
            next_source_id: 0,
            epoch: 0,
            issued_seq: 0,
            commit_seq: 0,
            ready: BTreeMap::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode and schedule one payload inline.
    ///
    /// Returns the new source, or `None` when it is held behind earlier
    /// tickets that are still decoding or the device is gone.
    pub fn enqueue(&mut self, payload: &str) -> Result<Option<SourceId>, DecodeError> {
        let ticket = self.reserve();
        match decode_chunk(payload, self.sample_rate) {
            Ok(buffer) => Ok(self.commit(ticket, Some(buffer)).last().copied()),
            Err(e) => {
                self.commit(ticket, None);
                Err(e)
            }
        }
    }

    /// Reserve the next queue position for a chunk about to be decoded.
    pub fn reserve(&mut self) -> DecodeTicket {
        let ticket = DecodeTicket {
            epoch: self.epoch,
            seq: self.issued_seq,
        };
        self.issued_seq += 1;
        ticket
    }

    /// Hand back a decode result. Returns the sources it allowed to start.
    ///
    /// Stale tickets are dropped; a failed decode releases its queue slot so
    /// later chunks are not held up.
    pub fn complete(
        &mut self,
        ticket: DecodeTicket,
        decoded: Result<DecodedAudioBuffer, DecodeError>,
    ) -> Vec<SourceId> {
        let slot = match decoded {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                None
            }
        };
        self.commit(ticket, slot)
    }

    fn commit(&mut self, ticket: DecodeTicket, slot: Option<DecodedAudioBuffer>) -> Vec<SourceId> {
        if ticket.epoch != self.epoch {
            debug!(
                "Discarding audio decoded for epoch {} (current {})",
                ticket.epoch, self.epoch
            );
            return Vec::new();
        }
        self.ready.insert(ticket.seq, slot);

        let mut started = Vec::new();
        while let Some(slot) = self.ready.remove(&self.commit_seq) {
            self.commit_seq += 1;
            if let Some(buffer) = slot {
                if let Some(id) = self.schedule(buffer) {
                    started.push(id);
                }
            }
        }
        started
    }

    /// Read the clock, place the buffer, and advance `next_start_time`.
    fn schedule(&mut self, buffer: DecodedAudioBuffer) -> Option<SourceId> {
        let Some(device) = self.device.as_mut() else {
            debug!("Output device closed; dropping audio chunk");
            return None;
        };

        let now = device.current_time();
        let start_time = self.next_start_time.max(now);
        let buffer = Arc::new(buffer);
        let duration = buffer.duration();
        let id = self.next_source_id;
        self.next_source_id += 1;

        if let Err(e) = device.start(id, buffer.clone(), start_time) {
            warn!("Failed to start playback source {}: {}", id, e);
            return None;
        }

        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s (clock {:.3}s)",
            id, start_time, duration, now
        );
        self.active.insert(
            id,
            PlaybackSource {
                id,
                buffer,
                start_time,
                created_at: now,
            },
        );
        self.next_start_time = start_time + duration;
        Some(id)
    }

    /// Natural end of playback. Returns false for sources already removed.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: silence everything now and forget pending decodes.
    pub fn interrupt(&mut self) {
        let cancelled = self.active.len();
        if let Some(device) = self.device.as_mut() {
            for id in self.active.keys() {
                device.stop(*id);
            }
        }
        self.active.clear();
        self.ready.clear();
        self.next_start_time = 0.0;
        self.epoch += 1;
        self.commit_seq = self.issued_seq;

        if cancelled > 0 {
            info!("Playback interrupted, {} source(s) cancelled", cancelled);
        }
    }

    /// Interrupt and release the output device. Never fails.
    pub fn shutdown(&mut self) {
        self.interrupt();
        if let Some(mut device) = self.device.take() {
            match device.close() {
                Ok(()) => info!("Audio output closed"),
                Err(e) => warn!("Failed to close audio output: {}", e),
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.device.is_none()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_sources(&self) -> impl Iterator<Item = &PlaybackSource> {
        self.active.values()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains_key(&id)
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
