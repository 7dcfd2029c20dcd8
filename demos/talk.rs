//! Talk to a conversational agent from the terminal.
//!
//! Captures the default microphone, plays the agent on the default speaker
//! and prints the transcript until Ctrl-C is pressed.
//!
//! # Usage
//!
//! ```bash
//! # Public agent:
//! STREAM_VOICE_AGENT_ID=agent_123 cargo run --example talk
//!
//! # Pre-signed URL:
//! STREAM_VOICE_SIGNED_URL='wss://...' cargo run --example talk
//!
//! # List devices:
//! cargo run --example talk -- --list
//! ```

use std::env;

use stream_voice::device::CpalBackend;
use stream_voice::{
    event_callback, ConnectionTarget, ConversationEvent, ConversationManager, SessionConfig,
};
use tracing_subscriber::EnvFilter;

fn list_devices() {
    println!("Input devices:");
    match CpalBackend::input_device_names() {
        Ok(names) => names.iter().for_each(|name| println!("  {name}")),
        Err(e) => println!("  <error: {e}>"),
    }
    println!("Output devices:");
    match CpalBackend::output_device_names() {
        Ok(names) => names.iter().for_each(|name| println!("  {name}")),
        Err(e) => println!("  <error: {e}>"),
    }
}

fn target_from_env() -> Option<ConnectionTarget> {
    if let Ok(url) = env::var("STREAM_VOICE_SIGNED_URL") {
        return Some(ConnectionTarget::SignedUrl(url));
    }
    env::var("STREAM_VOICE_AGENT_ID")
        .ok()
        .map(ConnectionTarget::AgentId)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if env::args().any(|arg| arg == "--list") {
        list_devices();
        return Ok(());
    }

    let Some(target) = target_from_env() else {
        eprintln!("Set STREAM_VOICE_AGENT_ID or STREAM_VOICE_SIGNED_URL");
        std::process::exit(2);
    };

    let mut backend = CpalBackend::new();
    if let Ok(name) = env::var("STREAM_VOICE_INPUT") {
        backend = backend.with_input_device(name);
    }
    if let Ok(name) = env::var("STREAM_VOICE_OUTPUT") {
        backend = backend.with_output_device(name);
    }

    let manager = ConversationManager::builder()
        .backend(backend)
        .on_event(event_callback(|event| match event {
            ConversationEvent::Connected { conversation_id } => {
                tracing::info!(%conversation_id, "Connected. Start talking, Ctrl-C to stop.");
            }
            ConversationEvent::Message { source, text } => tracing::info!("{source}: {text}"),
            ConversationEvent::ModeChanged(mode) => tracing::debug!(%mode, "Mode changed"),
            ConversationEvent::Error { message } => tracing::error!("{message}"),
            ConversationEvent::Disconnected { reason } => {
                tracing::info!(?reason, "Disconnected");
            }
            other => tracing::trace!(?other, "Conversation event"),
        }))
        .build();

    let session = manager.start_session(SessionConfig::new(target)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nEnding conversation...");
            session.end().await;
        }
        () = async {
            while session.is_connected() {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        } => {}
    }

    let stats = session.stats();
    println!(
        "Sent {} chunks, received {} audio events ({} interruptions)",
        stats.chunks_sent, stats.audio_events_received, stats.interruptions
    );
    Ok(())
}
