//! Coalesces streamed transcription fragments into finalized turns.

use crate::events::Speaker;

/// A finalized transcript entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: Speaker,
    text: String,
}

impl Message {
    pub fn sender(&self) -> Speaker {
        self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Per-direction pending buffers plus the append-only transcript log.
///
/// The pending text of a direction doubles as its partial view: there is at
/// most one per direction and it is replaced, never accumulated.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    pending_user: String,
    pending_agent: String,
    log: Vec<Message>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the updated partial text for `speaker`.
    pub fn append_fragment(&mut self, speaker: Speaker, text_delta: &str) -> &str {
        let pending = self.pending_mut(speaker);
        pending.push_str(text_delta);
        pending
    }

    /// Finalize the current turn, returning the messages it appended.
    ///
    /// User text is appended before agent text. Buffers that are empty after
    /// trimming produce nothing. Both buffers are cleared either way.
    pub fn complete_turn(&mut self) -> &[Message] {
        let first_new = self.log.len();

        for speaker in [Speaker::User, Speaker::Agent] {
            let pending = std::mem::take(self.pending_mut(speaker));
            let text = pending.trim();
            if !text.is_empty() {
                self.log.push(Message {
                    sender: speaker,
                    text: text.to_string(),
                });
            }
        }

        &self.log[first_new..]
    }

    /// Drop pending text without finalizing it.
    pub fn clear_pending(&mut self) {
        self.pending_user.clear();
        self.pending_agent.clear();
    }

    /// Live text for `speaker`, if any has arrived this turn.
    pub fn partial(&self, speaker: Speaker) -> Option<&str> {
        let pending = match speaker {
            Speaker::User => &self.pending_user,
            Speaker::Agent => &self.pending_agent,
        };
        if pending.is_empty() {
            None
        } else {
            Some(pending)
        }
    }

    pub fn log(&self) -> &[Message] {
        &self.log
    }

    fn pending_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.pending_user,
            Speaker::Agent => &mut self.pending_agent,
        }
    }
}
