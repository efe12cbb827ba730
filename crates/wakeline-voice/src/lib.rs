//! # Wakeline Voice - Wake-Word Gated Realtime Voice Sessions
//!
//! This crate implements the client side of a duplex realtime speech session:
//! microphone capture, wake-word gated transmission, JSON event exchange and
//! per-turn playback with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Voice Session                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Audio In   │→ │  Wake Scorer │→ │  Audio Gate  │        │
//! │  │    (cpal)    │  │              │  │  (debounce)  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │         ↓                                     ↓              │
//! │  ┌──────────────┐     ┌────────────────────────────┐         │
//! │  │ StreamMerger │ ←── │  Realtime Channel (ws/json)│         │
//! │  └──────────────┘     └────────────────────────────┘         │
//! │         ↓                                     ↑              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │  Dispatcher  │→ │   Playback   │→ │  Audio Out   │        │
//! │  │              │  │ Accumulator  │  │   (rodio)    │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod gate;
pub mod indicator;
pub mod merge;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod wake;
pub mod wire;

pub use audio::{AudioBlock, AudioCapture, AudioConfig, OutputDevice, RodioOutput};
pub use config::SessionConfig;
pub use error::{VoiceError, VoiceResult};
pub use gate::{AudioGate, GateState, Route, TimerFire};
pub use indicator::{
    Indicator, LogIndicator, LogTranscript, NullIndicator, NullTranscript, TranscriptSink,
};
pub use merge::{MergedEvent, MergerBuilder, StreamMerger};
pub use playback::PlaybackAccumulator;
pub use protocol::{ClientEvent, ProtocolHandle, ServerEvent, SessionUpdate};
pub use session::{SessionHandle, SessionIo, VoiceSession};
pub use wake::{EnergyScorer, ScoreMap, WakeWordScorer};
pub use wire::{pipe, MessageSink, MessageSource, WsChannel};
