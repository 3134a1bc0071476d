//! Error types shared by the capture, playback and session layers.

use crate::events::SessionState;
use crate::gemini::GeminiError;
use libpulse_binding::error::PAErr;
use thiserror::Error;

/// Fatal errors surfaced by the session controller.
///
/// Every variant except `Busy` drives a full teardown before it reaches the
/// caller; the session is back in `Idle` by the time it is observed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] GeminiError),

    #[error("Audio output unavailable: {0}")]
    Output(#[from] DeviceError),

    #[error("Session is not idle (state: {0:?})")]
    Busy(SessionState),
}

/// A malformed inbound audio payload. Never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("Empty audio payload")]
    Empty,
}

/// Failures talking to an audio device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("PulseAudio error: {0}")]
    Pulse(#[from] PAErr),

    #[error("Audio device closed")]
    Closed,

    #[error("Failed to spawn audio thread: {0}")]
    Spawn(#[from] std::io::Error),
}
