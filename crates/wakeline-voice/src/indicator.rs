//! Indicator and display capabilities
//!
//! Hardware actuation (LEDs, status widgets) stays out of the decision
//! logic: the gate and dispatcher call these seams at transition boundaries
//! only. A GPIO build implements `Indicator` over a pin; the TUI implements
//! `TranscriptSink` over its widgets; headless builds log.

use tracing::info;

/// Observes gate arm/disarm transitions. `on()` while audio is being
/// transmitted, `off()` otherwise.
pub trait Indicator: Send + Sync {
    fn on(&self);
    fn off(&self);
}

/// Indicator that does nothing.
#[derive(Debug, Default)]
pub struct NullIndicator;

impl Indicator for NullIndicator {
    fn on(&self) {}
    fn off(&self) {}
}

/// Indicator that logs transitions, for headless builds.
#[derive(Debug, Default)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn on(&self) {
        info!("Recording (gate armed)");
    }

    fn off(&self) {
        info!("Listening (gate dormant)");
    }
}

/// Receives session status and accumulated transcripts. No feedback into
/// the core.
pub trait TranscriptSink: Send + Sync {
    /// Called once the session id is known.
    fn session_ready(&self, session_id: &str);

    /// Called with the full accumulated transcript for a turn after each
    /// delta, so displays can redraw rather than append.
    fn transcript(&self, item_id: &str, text: &str);
}

/// Sink that does nothing.
#[derive(Debug, Default)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn session_ready(&self, _session_id: &str) {}
    fn transcript(&self, _item_id: &str, _text: &str) {}
}

/// Sink that logs, for headless builds.
#[derive(Debug, Default)]
pub struct LogTranscript;

impl TranscriptSink for LogTranscript {
    fn session_ready(&self, session_id: &str) {
        info!("Session ready: {}", session_id);
    }

    fn transcript(&self, item_id: &str, text: &str) {
        info!("[{}] {}", item_id, text);
    }
}
