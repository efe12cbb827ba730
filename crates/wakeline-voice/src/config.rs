//! Session configuration shared by every deployment variant
//!
//! The desktop TUI, headless daemon and GPIO-attached device builds of the
//! original fleet are the same core under different numbers. Each variant is
//! a `SessionConfig` preset, not a separate program.

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;

/// Immutable configuration consumed by the session core.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wake-word label that arms the gate (e.g. "hey_jarvis").
    pub trigger_label: String,

    /// Confidence above this arms the gate (default 0.5).
    pub trigger_threshold: f32,

    /// Quiet period before the gate reverts to listening.
    pub debounce: Duration,

    /// Capture rate for blocks transmitted to the session (Hz).
    pub capture_sample_rate: u32,

    /// Capture rate for blocks fed to the wake-word scorer (Hz).
    pub scorer_sample_rate: u32,

    /// Block length in milliseconds (default 20).
    pub chunk_ms: u32,

    /// Realtime model negotiated at connect.
    pub model: String,

    /// Synthesis voice id.
    pub voice: String,

    /// Transcription model for input audio.
    pub transcription_model: String,

    /// Optional system instructions sent with session.update.
    pub instructions: Option<String>,

    /// When true the gate is forced dormant while playback audio is queued
    /// and re-arms only after response.done and a full drain.
    pub half_duplex: bool,
}

impl SessionConfig {
    /// Desktop variant: short debounce, full-duplex barge-in.
    pub fn desktop() -> Self {
        Self {
            trigger_label: "hey_jarvis".to_string(),
            trigger_threshold: 0.5,
            debounce: Duration::from_secs(3),
            capture_sample_rate: 24000,
            scorer_sample_rate: 16000,
            chunk_ms: 20,
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "coral".to_string(),
            transcription_model: "whisper-1".to_string(),
            instructions: None,
            half_duplex: false,
        }
    }

    /// Headless daemon variant: long debounce, half-duplex so the device
    /// cannot re-trigger on its own synthesized voice.
    pub fn headless() -> Self {
        Self {
            debounce: Duration::from_secs(15),
            half_duplex: true,
            ..Self::desktop()
        }
    }

    /// Embedded device variant (physical indicator, speaker close to mic).
    pub fn device() -> Self {
        Self {
            debounce: Duration::from_secs(15),
            half_duplex: true,
            ..Self::desktop()
        }
    }

    /// Validate invariants the core relies on.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.trigger_label.trim().is_empty() {
            return Err(VoiceError::Config("trigger_label must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.trigger_threshold) || self.trigger_threshold == 0.0 {
            return Err(VoiceError::Config(format!(
                "trigger_threshold must be in (0, 1], got {}",
                self.trigger_threshold
            )));
        }
        if self.capture_sample_rate == 0 || self.scorer_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".into()));
        }
        if self.chunk_ms == 0 {
            return Err(VoiceError::Config("chunk_ms must be non-zero".into()));
        }
        if self.debounce.is_zero() {
            return Err(VoiceError::Config("debounce must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::desktop()
    }
}
