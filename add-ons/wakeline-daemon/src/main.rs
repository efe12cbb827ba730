//! Wakeline Voice Daemon
//!
//! Headless voice session: captures the microphone, arms on the wake word,
//! streams audio to the realtime endpoint and plays replies back. Profile
//! and endpoint come from the environment.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wakeline_voice::{
    AudioCapture, AudioConfig, EnergyScorer, LogIndicator, LogTranscript, RodioOutput,
    SessionConfig, SessionIo, VoiceSession, WsChannel,
};

const DEFAULT_ENDPOINT_BASE: &str = "wss://api.openai.com/v1/realtime";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[wakeline-daemon] .env not loaded: {} (using system environment)",
            e
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from_env()?;
    config.validate().context("invalid session config")?;

    let endpoint = endpoint_from_env(&config);
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; connecting without auth headers");
    }

    let (sink, source) = WsChannel::connect(&endpoint, api_key.as_deref())
        .await
        .context("realtime channel connect failed")?;

    match AudioCapture::list_input_devices() {
        Ok(devices) if !devices.is_empty() => {
            tracing::info!("input devices: {}", devices.join(", "))
        }
        Ok(_) => tracing::warn!("no input devices enumerated"),
        Err(e) => tracing::warn!("input device enumeration failed: {}", e),
    }

    // Two capture feeds from the same device: transmission-rate blocks for
    // the session, scorer-rate blocks for the wake-word model.
    let (mic_tx, mic_rx) = mpsc::channel(64);
    let mic_capture = AudioCapture::new(AudioConfig {
        sample_rate: config.capture_sample_rate,
        channels: 1,
        block_ms: config.chunk_ms,
    })
    .context("open microphone for transmission")?;
    let _mic_stream = mic_capture
        .start_capture(mic_tx)
        .context("start transmission capture")?;

    let (scorer_tx, scorer_rx) = mpsc::channel(64);
    let scorer_capture = AudioCapture::new(AudioConfig {
        sample_rate: config.scorer_sample_rate,
        channels: 1,
        block_ms: config.chunk_ms,
    })
    .context("open microphone for wake scoring")?;
    let _scorer_stream = scorer_capture
        .start_capture(scorer_tx)
        .context("start scorer capture")?;

    let output = RodioOutput::new(config.capture_sample_rate).context("open playback device")?;

    let io = SessionIo {
        sink: Box::new(sink),
        source: Box::new(source),
        mic_rx,
        scorer_rx,
        scorer: Box::new(EnergyScorer::new(config.trigger_label.clone())),
        output: Box::new(output),
        indicator: Arc::new(LogIndicator),
        display: Arc::new(LogTranscript),
    };

    tracing::info!(
        trigger = %config.trigger_label,
        debounce_secs = config.debounce.as_secs(),
        half_duplex = config.half_duplex,
        "wakeline daemon started"
    );

    let mut handle = VoiceSession::start(config, io)?;

    tokio::select! {
        result = handle.ready() => {
            result.context("session ended before becoming ready")?;
            tracing::info!("realtime session established");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received before session ready; exiting");
            return Ok(());
        }
    }

    tokio::select! {
        result = handle.join() => {
            result.context("voice session ended abnormally")?;
            tracing::info!("voice session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; shutting down daemon");
        }
    }

    Ok(())
}

/// Build the session config from WAKELINE_PROFILE plus per-field overrides.
fn config_from_env() -> anyhow::Result<SessionConfig> {
    let profile = std::env::var("WAKELINE_PROFILE").unwrap_or_else(|_| "headless".into());
    let mut config = match profile.as_str() {
        "desktop" => SessionConfig::desktop(),
        "headless" => SessionConfig::headless(),
        "device" => SessionConfig::device(),
        other => bail!("unknown WAKELINE_PROFILE {other:?} (desktop|headless|device)"),
    };

    if let Ok(label) = std::env::var("WAKELINE_TRIGGER") {
        config.trigger_label = label;
    }
    if let Some(threshold) = parse_env("WAKELINE_THRESHOLD")? {
        config.trigger_threshold = threshold;
    }
    if let Some(secs) = parse_env::<u64>("WAKELINE_DEBOUNCE_SECS")? {
        config.debounce = Duration::from_secs(secs);
    }
    if let Ok(model) = std::env::var("WAKELINE_MODEL") {
        config.model = model;
    }
    if let Ok(voice) = std::env::var("WAKELINE_VOICE") {
        config.voice = voice;
    }
    if let Ok(instructions) = std::env::var("WAKELINE_INSTRUCTIONS") {
        config.instructions = Some(instructions);
    }

    Ok(config)
}

/// Realtime endpoint: WAKELINE_ENDPOINT verbatim if set, otherwise the
/// default host with the configured model in the query string.
fn endpoint_from_env(config: &SessionConfig) -> String {
    std::env::var("WAKELINE_ENDPOINT")
        .unwrap_or_else(|_| format!("{DEFAULT_ENDPOINT_BASE}?model={}", config.model))
}

fn parse_env<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => bail!("{name} is not a valid value: {raw:?}"),
        },
    }
}
