//! Gemini Live API transport
//!
//! Implements [`LiveTransport`] over a split WebSocket: the write half is
//! owned by a writer task that serializes outbound audio, and the read half by
//! a reader task that turns server messages into [`InboundEvent`]s.

use crate::codec::EncodedAudioChunk;
use crate::events::InboundEvent;
use crate::gemini::{
    parse_server_message, BidiGenerateContentSetup, ClientMessage, GeminiError, Result,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Everything needed to open one live session.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub api_key: String,
    pub setup: BidiGenerateContentSetup,
    pub setup_timeout: Duration,
}

/// An open session: fire-and-forget outbound audio, ordered inbound events,
/// and the handle that closes it.
pub struct LiveSession {
    pub outbound: mpsc::UnboundedSender<EncodedAudioChunk>,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub handle: Box<dyn SessionHandle>,
}

pub trait SessionHandle: Send {
    /// Best-effort close. Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Connects to the remote agent.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<LiveSession>;
}

/// The production transport, talking to the public Live API endpoint.
#[derive(Debug, Clone)]
pub struct GeminiTransport {
    endpoint: String,
}

impl Default for GeminiTransport {
    fn default() -> Self {
        Self {
            endpoint: LIVE_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl LiveTransport for GeminiTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<LiveSession> {
        let url = format!("{}?key={}", self.endpoint, request.api_key);
        info!("Connecting to Gemini API at {}", self.endpoint);

        let (ws_stream, resp) = connect_async(url).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        info!("Sending setup message with model: {}", request.setup.model);
        let setup = ClientMessage::Setup(request.setup).to_json()?;
        sink.send(Message::text(setup)).await?;

        tokio::time::timeout(request.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                GeminiError::Timeout
            })??;
        info!("Gemini session setup complete");

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(stream, inbound_tx));
        let writer = tokio::spawn(write_loop(sink, outbound_rx, close_rx));

        Ok(LiveSession {
            outbound: outbound_tx,
            inbound: inbound_rx,
            handle: Box::new(GeminiSessionHandle {
                close_tx: Some(close_tx),
                reader: Some(reader),
                _writer: writer,
            }),
        })
    }
}

struct GeminiSessionHandle {
    close_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    _writer: JoinHandle<()>,
}

impl SessionHandle for GeminiSessionHandle {
    fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        match self.close_tx.take() {
            Some(tx) => tx.send(()).map_err(|_| GeminiError::ConnectionClosed),
            None => Ok(()),
        }
    }
}

impl Drop for GeminiSessionHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<()> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(frame) => {
                error!("WebSocket closed during setup: {:?}", frame);
                return Err(GeminiError::ConnectionClosed);
            }
            _ => continue,
        };

        if parse_server_message(&text)?.setup_complete {
            return Ok(());
        }
        debug!("Ignoring message before setupComplete: {}", text);
    }
    Err(GeminiError::SetupNotComplete)
}

async fn read_loop(mut stream: WsStream, inbound: mpsc::Sender<InboundEvent>) {
    info!("Inbound message task started");

    let terminal = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            // The Live API delivers JSON in binary frames too.
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                break InboundEvent::Closed(frame.map(|f| f.reason.to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                break InboundEvent::Error(e.to_string());
            }
            None => break InboundEvent::Closed(None),
        };

        let parsed = match parse_server_message(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse server message: {}", e);
                continue;
            }
        };
        for event in parsed.events {
            if inbound.send(event).await.is_err() {
                debug!("Inbound receiver dropped");
                return;
            }
        }
    };

    let _ = inbound.send(terminal).await;
    info!("Inbound message task terminated");
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<EncodedAudioChunk>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut close_rx => break,
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                let json = match ClientMessage::audio(chunk).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize audio chunk: {}", e);
                        continue;
                    }
                };
                // Capture keeps going; a dead socket surfaces on the read side.
                if let Err(e) = sink.send(Message::text(json)).await {
                    warn!("Failed to send audio chunk: {}", e);
                }
            }
        }
    }

    if let Ok(json) = ClientMessage::audio_stream_end().to_json() {
        let _ = sink.send(Message::text(json)).await;
    }
    if let Err(e) = sink.close().await {
        debug!("WebSocket close failed: {}", e);
    }
    info!("Outbound message task terminated");
}
