//! Capture pipeline: pulls fixed-size microphone blocks on a dedicated OS
//! thread and hands each one, as an [`AudioFrame`], to a frame callback.
//!
//! The capture thread owns the microphone and releases it when it exits, so
//! stopping never waits on a read in progress.

use crate::codec::{frame_from_pcm16, AudioFrame};
use crate::error::DeviceError;
use crate::events::DeviceEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, SendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Consecutive read failures after which capture gives up.
const MAX_READ_FAILURES: u32 = 10;

/// An acquired microphone stream delivering S16 mono samples.
pub trait MicSource: Send {
    fn sample_rate(&self) -> u32;

    /// Fill `block` with the next samples, blocking until they are captured.
    fn read_block(&mut self, block: &mut [i16]) -> Result<(), DeviceError>;

    /// Release the underlying device.
    fn release(self: Box<Self>) -> Result<(), DeviceError>;
}

fn release_mic(mic: Box<dyn MicSource>) {
    match mic.release() {
        Ok(()) => info!("Microphone released"),
        Err(e) => warn!("Failed to release microphone: {}", e),
    }
}

/// A running capture thread.
pub struct CapturePipeline {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start producing frames of `block_size` samples from `mic`.
    ///
    /// `on_frame` runs on the capture thread once per block, in capture order,
    /// and must not block. If the microphone keeps failing, capture ends and
    /// a [`DeviceEvent::Failed`] is sent on `events`. The microphone is
    /// released exactly once, including when the thread cannot be spawned.
    pub fn start<F>(
        mic: Box<dyn MicSource>,
        block_size: usize,
        events: mpsc::UnboundedSender<DeviceEvent>,
        on_frame: F,
    ) -> Result<Self, DeviceError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();

        info!(
            "Starting capture at {}Hz, {} samples per frame",
            mic.sample_rate(),
            block_size
        );

        // The mic is handed over only once the thread exists.
        let (mic_tx, mic_rx) = std_mpsc::sync_channel::<Box<dyn MicSource>>(1);
        let spawned = std::thread::Builder::new()
            .name("rhotalk-capture".to_string())
            .spawn(move || {
                if let Ok(mic) = mic_rx.recv() {
                    capture_loop(mic, block_size, &shutdown_flag, on_frame, &events);
                }
            });

        let handle = hand_off(mic, spawned, &mic_tx)?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the capture thread to finish. It releases the microphone after
    /// its current read. Later calls do nothing.
    pub fn stop(&mut self) {
        if self.handle.take().is_some() {
            self.shutdown.store(true, Ordering::Release);
            info!("Capture stopping");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn hand_off(
    mic: Box<dyn MicSource>,
    spawned: std::io::Result<JoinHandle<()>>,
    mic_tx: &std_mpsc::SyncSender<Box<dyn MicSource>>,
) -> Result<JoinHandle<()>, DeviceError> {
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to spawn capture thread: {}", e);
            release_mic(mic);
            return Err(e.into());
        }
    };
    if let Err(SendError(mic)) = mic_tx.send(mic) {
        release_mic(mic);
        return Err(DeviceError::Closed);
    }
    Ok(handle)
}

fn capture_loop<F>(
    mut mic: Box<dyn MicSource>,
    block_size: usize,
    shutdown: &AtomicBool,
    mut on_frame: F,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) where
    F: FnMut(AudioFrame),
{
    let sample_rate = mic.sample_rate();
    let mut block = vec![0i16; block_size];
    let mut failures = 0;

    while !shutdown.load(Ordering::Acquire) {
        match mic.read_block(&mut block) {
            Ok(()) => {
                failures = 0;
                // A read that straddled stop() is not delivered.
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                on_frame(frame_from_pcm16(&block, sample_rate));
            }
            Err(e) => {
                failures += 1;
                warn!("Microphone read failed ({}/{}): {}", failures, MAX_READ_FAILURES, e);
                if failures >= MAX_READ_FAILURES {
                    error!("Giving up on microphone capture");
                    let _ = events.send(DeviceEvent::Failed(format!("Microphone failed: {}", e)));
                    break;
                }
            }
        }
    }

    debug!("Capture thread exiting");
    release_mic(mic);
}
