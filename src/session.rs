//! Session lifecycle controller
//!
//! Owns the conversation state machine and every per-conversation resource.
//! All mutation happens on the task that drives [`SessionController::run`]:
//! inbound events, finished decodes and device reports are funneled through
//! one `select!` loop, so none of them race. Nothing here waits on a device:
//! stopping capture and closing the output only signal their threads.

use crate::audio::AudioBackend;
use crate::capture::{CapturePipeline, MicSource};
use crate::codec::{decode_chunk, encode_frame, DecodedAudioBuffer};
use crate::config::TalkConfig;
use crate::error::{DecodeError, SessionError};
use crate::events::{DeviceEvent, InboundEvent, SessionState, UiEvent};
use crate::gemini::live_setup;
use crate::gemini_client::{ConnectRequest, LiveSession, LiveTransport, SessionHandle};
use crate::playback::{DecodeTicket, PlaybackScheduler, SourceId};
use crate::transcript::{Message, TranscriptAggregator};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A decode that finished off the dispatch loop.
#[derive(Debug)]
pub struct DecodedChunk {
    pub ticket: DecodeTicket,
    pub result: Result<DecodedAudioBuffer, DecodeError>,
}

/// The receiving ends the dispatch loop selects over while Active.
pub struct ConversationIo {
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub decoded: mpsc::UnboundedReceiver<DecodedChunk>,
    pub devices: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// Everything acquired for one conversation. Each field is released at most
/// once; `None` means never acquired or already released.
#[derive(Default)]
struct Resources {
    mic: Option<Box<dyn MicSource>>,
    capture: Option<CapturePipeline>,
    scheduler: Option<PlaybackScheduler>,
    session: Option<Box<dyn SessionHandle>>,
    decoded_tx: Option<mpsc::UnboundedSender<DecodedChunk>>,
}

impl Resources {
    fn release(mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        // Only present when capture never started.
        if let Some(mic) = self.mic.take() {
            if let Err(e) = mic.release() {
                warn!("Failed to release microphone: {}", e);
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("Failed to close live session: {}", e);
            }
        }
    }
}

pub struct SessionController {
    config: TalkConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn LiveTransport>,
    observer: mpsc::UnboundedSender<UiEvent>,
    state: SessionState,
    resources: Option<Resources>,
    transcript: TranscriptAggregator,
}

impl SessionController {
    pub fn new(
        config: TalkConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn LiveTransport>,
        observer: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        Self {
            config,
            backend,
            transport,
            observer,
            state: SessionState::Idle,
            resources: None,
            transcript: TranscriptAggregator::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Finalized messages, across every conversation this controller ran.
    pub fn transcript(&self) -> &[Message] {
        self.transcript.log()
    }

    /// Begin a conversation: Idle/Closed -> Connecting -> Active.
    ///
    /// On failure everything acquired so far is released, the error is
    /// reported to the observer, and the controller is back in Idle.
    pub async fn start(&mut self) -> Result<ConversationIo, SessionError> {
        if !self.state.can_start() {
            return Err(SessionError::Busy(self.state));
        }

        self.set_state(SessionState::Connecting);
        match self.connect().await {
            Ok(io) => {
                self.set_state(SessionState::Active);
                self.status("Listening");
                Ok(io)
            }
            Err(e) => {
                error!("Failed to start conversation: {}", e);
                self.teardown(SessionState::Idle);
                self.emit(UiEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect(&mut self) -> Result<ConversationIo, SessionError> {
        let api_key = self
            .config
            .credential()
            .ok_or_else(|| SessionError::Config("GEMINI_API_KEY is not set".to_string()))?
            .to_string();
        if self.config.capture_block_size == 0 {
            return Err(SessionError::Config(
                "capture block size must be at least one sample".to_string(),
            ));
        }

        self.status("Requesting microphone");
        let mic = self.backend.open_microphone(&self.config)?;
        self.resources_mut().mic = Some(mic);

        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let device = self.backend.open_output(&self.config, device_tx.clone())?;
        let scheduler = PlaybackScheduler::new(device, self.config.output_sample_rate);
        self.resources_mut().scheduler = Some(scheduler);

        self.status(&format!("Connecting to {}", self.config.model));
        let request = ConnectRequest {
            api_key,
            setup: live_setup(&self.config),
            setup_timeout: self.config.setup_timeout,
        };
        let transport = self.transport.clone();
        let LiveSession {
            outbound,
            inbound,
            handle,
        } = transport.connect(request).await?;
        self.resources_mut().session = Some(handle);

        let mic = self
            .resources_mut()
            .mic
            .take()
            .ok_or_else(|| SessionError::Permission("microphone was released".to_string()))?;
        let capture = CapturePipeline::start(
            mic,
            self.config.capture_block_size,
            device_tx,
            move |frame| {
                if outbound.send(encode_frame(&frame)).is_err() {
                    debug!("Outbound channel closed; dropping audio frame");
                }
            },
        )?;
        self.resources_mut().capture = Some(capture);

        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
        self.resources_mut().decoded_tx = Some(decoded_tx);

        Ok(ConversationIo {
            inbound,
            decoded: decoded_rx,
            devices: device_rx,
        })
    }

    /// Drive an Active conversation until it closes, fails, or `stop` resolves.
    pub async fn run<F>(&mut self, mut io: ConversationIo, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        while self.state == SessionState::Active {
            tokio::select! {
                _ = &mut stop => {
                    info!("Stop requested");
                    self.stop();
                }
                event = io.inbound.recv() => {
                    self.dispatch(event.unwrap_or(InboundEvent::Closed(None)));
                }
                Some(chunk) = io.decoded.recv() => self.on_decoded(chunk),
                Some(event) = io.devices.recv() => self.on_device_event(event),
            }
        }
    }

    /// Apply one inbound event. Ignored unless Active.
    pub fn dispatch(&mut self, event: InboundEvent) {
        if self.state != SessionState::Active {
            debug!("Ignoring {:?} while {:?}", event, self.state);
            return;
        }

        match event {
            InboundEvent::Fragment(fragment) => {
                let text = self
                    .transcript
                    .append_fragment(fragment.speaker, &fragment.text_delta)
                    .to_string();
                self.emit(UiEvent::Partial {
                    speaker: fragment.speaker,
                    text,
                });
            }
            InboundEvent::TurnComplete => {
                let messages = self.transcript.complete_turn().to_vec();
                for message in messages {
                    info!("{}: {}", message.sender().label(), message.text());
                    self.emit(UiEvent::Message(message));
                }
                self.emit(UiEvent::PartialCleared);
            }
            InboundEvent::Interrupted => {
                if let Some(scheduler) = self.scheduler_mut() {
                    scheduler.interrupt();
                }
            }
            InboundEvent::Audio(payload) => self.decode_in_background(payload.data),
            InboundEvent::Closed(reason) => {
                match reason {
                    Some(reason) => self.status(&format!("Conversation closed: {}", reason)),
                    None => self.status("Conversation closed"),
                }
                self.teardown(SessionState::Closed);
            }
            InboundEvent::Error(message) => {
                error!("Live session error: {}", message);
                self.teardown(SessionState::Idle);
                self.emit(UiEvent::Error(message));
            }
        }
    }

    fn decode_in_background(&mut self, payload: String) {
        let Some(resources) = self.resources.as_mut() else {
            return;
        };
        let (Some(scheduler), Some(decoded_tx)) =
            (resources.scheduler.as_mut(), resources.decoded_tx.clone())
        else {
            return;
        };

        // The ticket fixes this chunk's place in line before decode starts.
        let ticket = scheduler.reserve();
        let sample_rate = scheduler.sample_rate();
        tokio::task::spawn_blocking(move || {
            let result = decode_chunk(&payload, sample_rate);
            let _ = decoded_tx.send(DecodedChunk { ticket, result });
        });
    }

    pub fn on_decoded(&mut self, chunk: DecodedChunk) {
        if let Some(scheduler) = self.scheduler_mut() {
            scheduler.complete(chunk.ticket, chunk.result);
        }
    }

    pub fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PlaybackEnded(id) => self.on_playback_ended(id),
            DeviceEvent::Failed(message) => {
                if self.state != SessionState::Active {
                    debug!("Ignoring device failure while {:?}: {}", self.state, message);
                    return;
                }
                error!("Audio device failed: {}", message);
                self.teardown(SessionState::Idle);
                self.emit(UiEvent::Error(message));
            }
        }
    }

    pub fn on_playback_ended(&mut self, id: SourceId) {
        if let Some(scheduler) = self.scheduler_mut() {
            if !scheduler.on_source_ended(id) {
                debug!("Source {} already removed", id);
            }
        }
    }

    /// User stop request.
    pub fn stop(&mut self) {
        self.status("Conversation ended");
        self.teardown(SessionState::Closed);
    }

    /// Release every conversation resource and settle in `target`.
    ///
    /// Safe to call from any path and any number of times; once nothing is
    /// held and the state allows a restart, further calls do nothing.
    pub fn teardown(&mut self, target: SessionState) {
        if self.resources.is_none() && self.state.can_start() {
            return;
        }

        self.set_state(SessionState::Closing);
        if let Some(resources) = self.resources.take() {
            resources.release();
        }
        self.transcript.clear_pending();
        self.emit(UiEvent::PartialCleared);
        self.set_state(target);
    }

    fn resources_mut(&mut self) -> &mut Resources {
        self.resources.get_or_insert_with(Resources::default)
    }

    fn scheduler_mut(&mut self) -> Option<&mut PlaybackScheduler> {
        self.resources.as_mut()?.scheduler.as_mut()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("Session state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(UiEvent::StateChanged(state));
    }

    fn status(&self, text: &str) {
        self.emit(UiEvent::Status(text.to_string()));
    }

    fn emit(&self, event: UiEvent) {
        // A dropped observer just means nobody is watching.
        let _ = self.observer.send(event);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown(SessionState::Closed);
    }
}
