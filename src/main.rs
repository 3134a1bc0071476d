//! rhotalk - practice a spoken language with a live Gemini agent.
//!
//! Talks through the default PulseAudio source and sink. The transcript goes
//! to stdout, logs to stderr. Ctrl+C ends the conversation.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use rhotalk::audio::PulseBackend;
use rhotalk::gemini_client::GeminiTransport;
use rhotalk::{SessionController, SessionState, TalkConfig, UiEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rhotalk")]
#[command(about = "Hold a live spoken conversation with a Gemini agent")]
struct Args {
    /// Language to practice
    #[arg(short, long)]
    language: Option<String>,

    /// Accent the agent should speak with
    #[arg(short, long)]
    accent: Option<String>,

    /// Emotional tone of the agent's replies
    #[arg(short, long)]
    emotion: Option<String>,

    /// Prebuilt voice name
    #[arg(short, long)]
    voice: Option<String>,

    /// Live API model
    #[arg(short, long)]
    model: Option<String>,

    /// Microphone samples per outbound chunk
    #[arg(long)]
    block_size: Option<usize>,

    /// PulseAudio source to record from
    #[arg(long)]
    input_device: Option<String>,
}

impl Args {
    fn apply(self, config: &mut TalkConfig) {
        if let Some(language) = self.language {
            config.language = language;
        }
        if let Some(accent) = self.accent {
            config.accent = accent;
        }
        if let Some(emotion) = self.emotion {
            config.emotion = emotion;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(block_size) = self.block_size {
            config.capture_block_size = block_size.max(1);
        }
        if self.voice.is_some() {
            config.voice = self.voice;
        }
    }
}

fn render(event: UiEvent) {
    match event {
        UiEvent::StateChanged(state) => info!("State: {:?}", state),
        UiEvent::Status(text) => println!("[{}]", text),
        UiEvent::Error(text) => eprintln!("error: {}", text),
        UiEvent::Partial { speaker, text } => println!("  {}… {}", speaker.label(), text.trim()),
        UiEvent::PartialCleared => {}
        UiEvent::Message(message) => {
            println!("{}: {}", message.sender().label(), message.text())
        }
    }
}

/// Render events until every sender is gone, including ones already queued.
async fn render_all(mut ui_rx: mpsc::UnboundedReceiver<UiEvent>, mut draw: impl FnMut(UiEvent)) {
    while let Some(event) = ui_rx.recv().await {
        draw(event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let backend = PulseBackend {
        input_device: args.input_device.clone(),
    };
    let mut config = TalkConfig::from_env();
    args.apply(&mut config);

    info!(
        "Starting rhotalk: {} with a {} accent, {} tone",
        config.language, config.accent, config.emotion
    );

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_all(ui_rx, render));

    let mut controller = SessionController::new(
        config,
        Arc::new(backend),
        Arc::new(GeminiTransport::default()),
        ui_tx,
    );

    let io = match controller.start().await {
        Ok(io) => io,
        Err(e) => {
            // Let the renderer print the error event before exiting.
            drop(controller);
            renderer.await?;
            return Err(e.into());
        }
    };
    println!("Speak now. Press Ctrl+C to stop.");

    controller
        .run(io, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    let finished = controller.state();
    let turns = controller.transcript().len();
    drop(controller);
    renderer.await?;

    info!("Conversation over ({:?}), {} message(s)", finished, turns);
    if finished == SessionState::Idle {
        anyhow::bail!("conversation ended with an error");
    }
    Ok(())
}
