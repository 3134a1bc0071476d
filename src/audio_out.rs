//! PulseAudio output device with a sample-accurate clock.
//!
//! A mixer thread writes the sink in 20 ms blocks, silence included, so the
//! frame position advances in real time and serves as the output clock the
//! playback scheduler plans against. The clock is published before each
//! blocking write and always names the first frame not yet mixed, so a source
//! started at the current clock is heard from its first sample.

use crate::codec::DecodedAudioBuffer;
use crate::error::DeviceError;
use crate::events::DeviceEvent;
use crate::playback::{OutputDevice, SourceId};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, TryRecvError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Mixer blocks per second (20 ms blocks).
const BLOCKS_PER_SECOND: u32 = 50;
/// Blocks the server may hold ahead of the speaker.
const TARGET_BLOCKS: u32 = 3;

enum Command {
    Start {
        id: SourceId,
        buffer: Arc<DecodedAudioBuffer>,
        start_frame: u64,
    },
    Stop(SourceId),
    Close,
}

struct Voice {
    id: SourceId,
    buffer: Arc<DecodedAudioBuffer>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

/// Voices placed on one frame timeline, mixed a block at a time.
#[derive(Default)]
struct Mixer {
    /// First frame not yet mixed.
    position: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    fn position(&self) -> u64 {
        self.position
    }

    /// Place a voice. A start already mixed past is moved up to the current
    /// position rather than losing its head.
    fn start(&mut self, id: SourceId, buffer: Arc<DecodedAudioBuffer>, start_frame: u64) {
        if start_frame < self.position {
            debug!(
                "Source {} asked for frame {} but mixer is at {}",
                id, start_frame, self.position
            );
        }
        self.voices.push(Voice {
            id,
            buffer,
            start_frame: start_frame.max(self.position),
        });
    }

    fn stop(&mut self, id: SourceId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Mix the next `out.len()` frames and advance. Returns the new position.
    fn render(&mut self, out: &mut [f32]) -> u64 {
        let block_end = self.position + out.len() as u64;
        out.fill(0.0);

        for voice in &self.voices {
            let from = voice.start_frame.max(self.position);
            let to = voice.end_frame().min(block_end);
            let samples = voice.buffer.samples();
            for frame in from..to {
                out[(frame - self.position) as usize] +=
                    samples[(frame - voice.start_frame) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = block_end;
        block_end
    }

    /// Drop voices that have been mixed to the end, returning their ids.
    fn retire(&mut self) -> Vec<SourceId> {
        let position = self.position;
        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            let done = voice.end_frame() <= position;
            if done {
                finished.push(voice.id);
            }
            !done
        });
        finished
    }
}

pub struct PulseOutput {
    sample_rate: u32,
    frames_mixed: Arc<AtomicU64>,
    commands: std_mpsc::Sender<Command>,
    closed: bool,
}

impl PulseOutput {
    pub fn open(
        app_name: &str,
        sample_rate: u32,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self, DeviceError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: sample_rate,
        };
        let block_bytes = (sample_rate / BLOCKS_PER_SECOND) * 4;
        let buffer_attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: block_bytes * TARGET_BLOCKS,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            None,
            "agent voice",
            &spec,
            None,
            Some(&buffer_attr),
        )?;

        let frames_mixed = Arc::new(AtomicU64::new(0));
        let clock = frames_mixed.clone();
        let (commands, command_rx) = std_mpsc::channel();

        // Detached: close() only signals, the thread flushes and exits itself.
        std::thread::Builder::new()
            .name("rhotalk-playback".to_string())
            .spawn(move || {
                if let Err(e) = run_mixer(simple, sample_rate, clock, command_rx, &events) {
                    error!("Audio output failed: {}", e);
                    let _ = events.send(DeviceEvent::Failed(e.to_string()));
                }
            })?;

        info!("Audio output opened at {}Hz", sample_rate);

        Ok(Self {
            sample_rate,
            frames_mixed,
            commands,
            closed: false,
        })
    }

    fn send(&self, command: Command) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        self.commands.send(command).map_err(|_| DeviceError::Closed)
    }
}

impl OutputDevice for PulseOutput {
    fn current_time(&self) -> f64 {
        self.frames_mixed.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn start(
        &mut self,
        id: SourceId,
        buffer: Arc<DecodedAudioBuffer>,
        start_time: f64,
    ) -> Result<(), DeviceError> {
        let start_frame = (start_time * self.sample_rate as f64).round() as u64;
        self.send(Command::Start {
            id,
            buffer,
            start_frame,
        })
    }

    fn stop(&mut self, id: SourceId) {
        let _ = self.send(Command::Stop(id));
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Ok(());
        }
        let sent = self.send(Command::Close);
        self.closed = true;
        sent
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_mixer(
    simple: Simple,
    sample_rate: u32,
    frames_mixed: Arc<AtomicU64>,
    commands: std_mpsc::Receiver<Command>,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) -> Result<(), DeviceError> {
    let block_frames = (sample_rate / BLOCKS_PER_SECOND).max(1) as usize;
    let mut mix = vec![0f32; block_frames];
    let mut bytes = Vec::with_capacity(block_frames * 4);
    let mut mixer = Mixer::default();

    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Start {
                    id,
                    buffer,
                    start_frame,
                }) => mixer.start(id, buffer, start_frame),
                Ok(Command::Stop(id)) => mixer.stop(id),
                Ok(Command::Close) | Err(TryRecvError::Disconnected) => {
                    simple.flush()?;
                    debug!("Mixer thread exiting at frame {}", mixer.position());
                    return Ok(());
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let block_end = mixer.render(&mut mix);
        frames_mixed.store(block_end, Ordering::Release);

        bytes.clear();
        for sample in &mix {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        // Blocks until the server has room, which paces the loop.
        simple.write(&bytes)?;

        for id in mixer.retire() {
            let _ = events.send(DeviceEvent::PlaybackEnded(id));
        }
    }
}
