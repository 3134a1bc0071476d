//! Conversation configuration

use std::time::Duration;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Configuration for one conversation.
///
/// Language, accent and emotion come from the selection menus of whatever
/// front end drives the session and are only read here.
#[derive(Debug, Clone)]
pub struct TalkConfig {
    pub api_key: Option<String>,
    pub model: String,
    /// Prebuilt voice name passed in `speechConfig`, if any.
    pub voice: Option<String>,
    pub language: String,
    pub accent: String,
    pub emotion: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per capture frame.
    pub capture_block_size: usize,
    pub app_name: String,
    pub setup_timeout: Duration,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: None,
            language: "English".to_string(),
            accent: "neutral".to_string(),
            emotion: "friendly".to_string(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            capture_block_size: 4096,
            app_name: "rhotalk".to_string(),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl TalkConfig {
    /// Defaults plus the API key from `GEMINI_API_KEY` (or `API_KEY`).
    pub fn from_env() -> Self {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .ok();
        Self {
            api_key,
            ..Default::default()
        }
    }

    /// The API key if one is configured and non-blank.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn system_instruction(&self) -> String {
        format!(
            "You are a warm, patient conversation partner helping the user practice spoken {language}. \
             Always reply in {language}, speaking with a {accent} accent. \
             Let a {emotion} tone come through in every reply. \
             Keep answers short and conversational so the user can respond, \
             and gently correct mistakes by repeating the phrase the natural way.",
            language = self.language,
            accent = self.accent,
            emotion = self.emotion,
        )
    }
}
