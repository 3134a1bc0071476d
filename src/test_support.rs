//! Deterministic stand-ins for devices and the transport.

use crate::audio::AudioBackend;
use crate::capture::MicSource;
use crate::codec::{DecodedAudioBuffer, EncodedAudioChunk};
use crate::config::TalkConfig;
use crate::error::{DeviceError, SessionError};
use crate::events::{DeviceEvent, InboundEvent};
use crate::gemini::GeminiError;
use crate::gemini_client::{ConnectRequest, LiveSession, LiveTransport, SessionHandle};
use crate::playback::{OutputDevice, SourceId};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Base64 PCM16LE silence lasting `seconds` at `rate`.
pub fn pcm_payload(seconds: f64, rate: u32) -> String {
    let frames = (seconds * rate as f64).round() as usize;
    general_purpose::STANDARD.encode(vec![0u8; frames * 2])
}

/// Poll `condition` until it holds, giving up after a few seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, seconds: f64) {
        *self.0.lock().unwrap() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.0.lock().unwrap() += seconds;
    }
}

#[derive(Debug, Default)]
struct OutputLog {
    /// (id, start, duration, clock when started)
    started: Vec<(SourceId, f64, f64, f64)>,
    stopped: Vec<SourceId>,
    closed: usize,
}

/// Output device that only records what it was asked to do.
#[derive(Debug, Clone)]
pub struct FakeOutput {
    clock: ManualClock,
    log: Arc<Mutex<OutputLog>>,
    fail_close: bool,
}

impl FakeOutput {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            log: Arc::default(),
            fail_close: false,
        }
    }

    pub fn failing_close(clock: ManualClock) -> Self {
        Self {
            fail_close: true,
            ..Self::new(clock)
        }
    }

    pub fn started(&self) -> Vec<(SourceId, f64, f64, f64)> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.log.lock().unwrap().stopped.clone()
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start(
        &mut self,
        id: SourceId,
        buffer: Arc<DecodedAudioBuffer>,
        start_time: f64,
    ) -> Result<(), DeviceError> {
        let now = self.clock.now();
        self.log
            .lock()
            .unwrap()
            .started
            .push((id, start_time, buffer.duration(), now));
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().closed += 1;
        if self.fail_close {
            Err(DeviceError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Microphone producing one block every `delay`, each stamped with its
/// sequence number in the first sample.
pub struct FakeMic {
    sample_rate: u32,
    seq: i16,
    failing: bool,
    delay: Duration,
    released: Arc<AtomicUsize>,
}

impl FakeMic {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            seq: 0,
            failing: false,
            delay: Duration::from_millis(2),
            released: Arc::default(),
        }
    }

    pub fn failing(sample_rate: u32) -> Self {
        Self {
            failing: true,
            ..Self::new(sample_rate)
        }
    }

    /// Each read blocks for `delay`, like a real device filling a block.
    pub fn slow(sample_rate: u32, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(sample_rate)
        }
    }

    pub fn released_counter(&self) -> Arc<AtomicUsize> {
        self.released.clone()
    }
}

impl MicSource for FakeMic {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_block(&mut self, block: &mut [i16]) -> Result<(), DeviceError> {
        std::thread::sleep(self.delay);
        if self.failing {
            return Err(DeviceError::Closed);
        }
        block.fill(0);
        block[0] = self.seq;
        self.seq = self.seq.wrapping_add(1);
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), DeviceError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend handing out fake devices and counting what it opened.
pub struct FakeBackend {
    pub deny_microphone: bool,
    pub failing_microphone: bool,
    pub mic_delay: Option<Duration>,
    pub fail_output: bool,
    pub clock: ManualClock,
    pub output: FakeOutput,
    pub mics_opened: AtomicUsize,
    pub outputs_opened: AtomicUsize,
    pub mic_released: Arc<AtomicUsize>,
    pub device_tx: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        Self {
            deny_microphone: false,
            failing_microphone: false,
            mic_delay: None,
            fail_output: false,
            output: FakeOutput::new(clock.clone()),
            clock,
            mics_opened: AtomicUsize::new(0),
            outputs_opened: AtomicUsize::new(0),
            mic_released: Arc::default(),
            device_tx: Mutex::new(None),
        }
    }

    /// Simulate the device reporting the natural end of a source.
    pub fn report_ended(&self, id: SourceId) {
        self.report(DeviceEvent::PlaybackEnded(id));
    }

    /// Simulate the output device dying mid-conversation.
    pub fn report_output_failure(&self, message: &str) {
        self.report(DeviceEvent::Failed(message.to_string()));
    }

    fn report(&self, event: DeviceEvent) {
        if let Some(tx) = self.device_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open_microphone(&self, config: &TalkConfig) -> Result<Box<dyn MicSource>, SessionError> {
        if self.deny_microphone {
            return Err(SessionError::Permission("access denied".to_string()));
        }
        self.mics_opened.fetch_add(1, Ordering::SeqCst);
        let mut mic = match self.mic_delay {
            Some(delay) => FakeMic::slow(config.input_sample_rate, delay),
            None => FakeMic::new(config.input_sample_rate),
        };
        mic.failing = self.failing_microphone;
        mic.released = self.mic_released.clone();
        Ok(Box::new(mic))
    }

    fn open_output(
        &self,
        _config: &TalkConfig,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError> {
        if self.fail_output {
            return Err(DeviceError::Closed);
        }
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        *self.device_tx.lock().unwrap() = Some(events);
        Ok(Box::new(self.output.clone()))
    }
}

/// The test-side ends of a fake live session.
pub struct FakeRemote {
    pub inbound: mpsc::Sender<InboundEvent>,
    pub outbound: mpsc::UnboundedReceiver<EncodedAudioChunk>,
}

struct FakeHandle {
    closes: Arc<AtomicUsize>,
}

impl SessionHandle for FakeHandle {
    fn close(&mut self) -> Result<(), GeminiError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(GeminiError::ConnectionClosed)
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub refuse: bool,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub last_request: Mutex<Option<ConnectRequest>>,
    pub remote: Mutex<Option<FakeRemote>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_remote(&self) -> FakeRemote {
        self.remote
            .lock()
            .unwrap()
            .take()
            .expect("no session was connected")
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<LiveSession, GeminiError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        if self.refuse {
            return Err(GeminiError::SetupNotComplete);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.remote.lock().unwrap() = Some(FakeRemote {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });

        Ok(LiveSession {
            outbound: outbound_tx,
            inbound: inbound_rx,
            handle: Box::new(FakeHandle {
                closes: self.closes.clone(),
            }),
        })
    }
}
