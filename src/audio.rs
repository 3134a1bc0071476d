//! Audio device access
//!
//! The session opens its microphone and speaker through [`AudioBackend`], so
//! the lifecycle can be driven without real hardware. [`PulseBackend`] is the
//! production implementation: microphone capture is read through PulseAudio's
//! simple API as 16-bit little-endian mono PCM, which is what the Live API
//! expects as input.

use crate::audio_out::PulseOutput;
use crate::capture::MicSource;
use crate::config::TalkConfig;
use crate::error::{DeviceError, SessionError};
use crate::events::DeviceEvent;
use crate::playback::OutputDevice;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tokio::sync::mpsc;
use tracing::info;

/// Opens the devices one conversation needs.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone. Failure is a permission error.
    fn open_microphone(&self, config: &TalkConfig) -> Result<Box<dyn MicSource>, SessionError>;

    /// Open the speaker. Natural ends of playback and device failures are
    /// reported on `events`.
    fn open_output(
        &self,
        config: &TalkConfig,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError>;
}

/// PulseAudio default source and sink.
#[derive(Debug, Clone, Default)]
pub struct PulseBackend {
    /// Specific source name; the server default is used when `None`.
    pub input_device: Option<String>,
}

impl AudioBackend for PulseBackend {
    fn open_microphone(&self, config: &TalkConfig) -> Result<Box<dyn MicSource>, SessionError> {
        let mic = PulseMicrophone::open(
            &config.app_name,
            self.input_device.as_deref(),
            config.input_sample_rate,
        )
        .map_err(|e| SessionError::Permission(e.to_string()))?;
        Ok(Box::new(mic))
    }

    fn open_output(
        &self,
        config: &TalkConfig,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError> {
        let output = PulseOutput::open(&config.app_name, config.output_sample_rate, events)?;
        Ok(Box::new(output))
    }
}

/// A PulseAudio record stream.
pub struct PulseMicrophone {
    simple: Simple,
    sample_rate: u32,
    bytes: Vec<u8>,
}

impl PulseMicrophone {
    pub fn open(
        app_name: &str,
        device_name: Option<&str>,
        sample_rate: u32,
    ) -> Result<Self, DeviceError> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Record,
            device_name, // default device when None
            "microphone",
            &spec,
            None, // default channel map
            None, // default buffering
        )?;

        info!(
            "Microphone opened: {} at {}Hz",
            device_name.unwrap_or("default source"),
            sample_rate
        );

        Ok(Self {
            simple,
            sample_rate,
            bytes: Vec::new(),
        })
    }
}

impl MicSource for PulseMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_block(&mut self, block: &mut [i16]) -> Result<(), DeviceError> {
        self.bytes.resize(block.len() * 2, 0);
        self.simple.read(&mut self.bytes)?;

        for (sample, pair) in block.iter_mut().zip(self.bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), DeviceError> {
        // Discards anything still buffered; the stream closes on drop.
        self.simple.flush()?;
        info!("Microphone released");
        Ok(())
    }
}
