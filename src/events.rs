use crate::playback::SourceId;
use crate::transcript::Message;

/// Which side of the conversation a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "you",
            Speaker::Agent => "agent",
        }
    }
}

/// Incremental transcription text for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text_delta: String,
}

/// Inline audio as delivered by the server: base64 PCM16LE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub data: String,
    pub mime_type: Option<String>,
}

/// Events coming in from the remote agent, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Fragment(TranscriptFragment),
    TurnComplete,
    Interrupted,
    Audio(AudioPayload),
    /// Remote side closed the session, with an optional reason.
    Closed(Option<String>),
    Error(String),
}

/// Out-of-band reports from the audio devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A playback source reached its natural end.
    PlaybackEnded(SourceId),
    /// A device stopped working for good.
    Failed(String),
}

/// Lifecycle of one conversation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether a new conversation may be started from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }
}

/// Notifications for whatever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    StateChanged(SessionState),
    Status(String),
    Error(String),
    /// Live text for one direction, replacing any earlier partial for it.
    Partial { speaker: Speaker, text: String },
    PartialCleared,
    Message(Message),
}
