//! rhotalk - live spoken conversation with a Gemini Live agent.
//!
//! Microphone audio streams out while the agent's synthesized speech streams
//! back and is scheduled for gapless playback. Both sides of the conversation
//! are transcribed and coalesced into finalized turns.

#![forbid(unsafe_code)]

pub mod audio;
pub mod audio_out;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod gemini;
pub mod gemini_client;
pub mod playback;
pub mod session;
pub mod transcript;

#[cfg(test)]
mod test_support;

pub use config::TalkConfig;
pub use error::SessionError;
pub use events::{SessionState, UiEvent};
pub use session::SessionController;
