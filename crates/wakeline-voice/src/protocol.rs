//! Duplex realtime protocol: wire events and the outbound session path
//!
//! Inbound and outbound events are closed serde-tagged enums rather than
//! stringly-typed dispatch; unknown inbound kinds deserialize to an explicit
//! `Ignored` variant so newer servers never break the client. Two protocol
//! revisions exist in the field (`response.audio.*` and
//! `response.output_audio.*`); the inbound enum accepts both.

use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::wire::{MessageSink, MessageSource};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound control and audio events, constructed fresh per send.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "response.cancel")]
    ResponseCancel {},

    #[serde(rename = "response.create")]
    ResponseCreate {},
}

impl ClientEvent {
    /// Audio append event from raw PCM16LE bytes.
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioAppend {
            audio: B64.encode(pcm),
        }
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Initial configuration negotiated right after connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdate {
    pub turn_detection: TurnDetection,
    pub voice: String,
    pub input_audio_transcription: TranscriptionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

impl SessionUpdate {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            turn_detection: TurnDetection::server_vad(),
            voice: config.voice.clone(),
            input_audio_transcription: TranscriptionConfig {
                model: config.transcription_model.clone(),
            },
            instructions: config.instructions.clone(),
            tools: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Inbound events. Unrecognized kinds map to `Ignored`, never an error.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(
        rename = "response.output_audio.delta",
        alias = "response.audio.delta"
    )]
    AudioDelta { item_id: String, delta: String },

    #[serde(
        rename = "response.output_audio_transcript.delta",
        alias = "response.audio_transcript.delta"
    )]
    TranscriptDelta { item_id: String, delta: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "response.done")]
    ResponseDone {},

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Ignored,
}

impl ServerEvent {
    /// Decode a base64 audio delta payload.
    pub fn decode_delta(delta: &str) -> VoiceResult<Vec<u8>> {
        B64.decode(delta)
            .map_err(|e| VoiceError::Decode(format!("bad audio delta: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerEvent {
    /// Human-readable message of an `error` event, whichever field carried it.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ServerEvent::Error { error, message } => error
                .as_ref()
                .and_then(|e| e.message.as_deref())
                .or(message.as_deref()),
            _ => None,
        }
    }
}

/// Outbound half of one duplex session.
///
/// A writer task owns the sink: it sends the initial `session.update`, then
/// forwards queued client events in order. Senders go through a
/// [`ProtocolHandle`]; readiness flips once `session.created` arrives and
/// stays set.
pub struct ProtocolSession;

impl ProtocolSession {
    /// Start the writer. Returns the sender handle, the readiness setter for
    /// the dispatcher, and the writer task (resolves on channel loss or when
    /// every handle is dropped).
    pub fn start(
        mut sink: Box<dyn MessageSink>,
        hello: SessionUpdate,
    ) -> (ProtocolHandle, watch::Sender<bool>, JoinHandle<VoiceResult<()>>) {
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(64);
        let (ready_tx, ready_rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            let hello = ClientEvent::SessionUpdate { session: hello };
            sink.send(hello.to_json()?).await?;
            info!("session.update sent, awaiting session.created");

            while let Some(event) = out_rx.recv().await {
                sink.send(event.to_json()?).await?;
            }
            debug!("protocol writer ended");
            Ok(())
        });

        (
            ProtocolHandle {
                out_tx,
                ready_rx,
            },
            ready_tx,
            writer,
        )
    }
}

/// Cloneable sender for outbound events.
#[derive(Clone)]
pub struct ProtocolHandle {
    out_tx: mpsc::Sender<ClientEvent>,
    ready_rx: watch::Receiver<bool>,
}

impl ProtocolHandle {
    /// True once `session.created` (or `session.updated`) has been seen.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until the session is ready.
    pub async fn ready(&mut self) -> VoiceResult<()> {
        self.ready_rx
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| VoiceError::ChannelClosed("session ended before ready".into()))?;
        Ok(())
    }

    /// Enqueue an event for transmission, in order behind prior sends.
    pub async fn send(&self, event: ClientEvent) -> VoiceResult<()> {
        self.out_tx
            .send(event)
            .await
            .map_err(|_| VoiceError::ChannelClosed("protocol writer gone".into()))
    }
}

/// Adapt the receive half into a stream of parsed events for the merger.
///
/// Undecodable frames are skipped with a warning (non-fatal); a transport
/// error is yielded as the terminal item.
pub fn event_stream(
    source: Box<dyn MessageSource>,
) -> impl Stream<Item = Result<ServerEvent, VoiceError>> + Send {
    stream::unfold(source, |mut source| async move {
        loop {
            match source.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), source)),
                Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => return Some((Ok(event), source)),
                    Err(e) => {
                        warn!("skipping undecodable frame: {}", e);
                        continue;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_append_encodes_base64() {
        let event = ClientEvent::audio_append(&[0x01, 0x02, 0x03]);
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"input_audio_buffer.append\""));
        assert!(json.contains(&B64.encode([0x01u8, 0x02, 0x03])));
    }

    #[test]
    fn session_update_shape() {
        let config = SessionConfig::desktop();
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdate::from_config(&config),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"session.update\""));
        assert!(json.contains("\"turn_detection\":{\"type\":\"server_vad\"}"));
        assert!(json.contains("\"voice\":\"coral\""));
        assert!(json.contains("\"model\":\"whisper-1\""));
        // No instructions configured: field omitted entirely.
        assert!(!json.contains("instructions"));
    }

    #[test]
    fn parses_audio_delta_both_revisions() {
        for kind in ["response.output_audio.delta", "response.audio.delta"] {
            let raw = format!(
                "{{\"type\":\"{kind}\",\"item_id\":\"item-1\",\"delta\":\"QUE=\"}}"
            );
            let event: ServerEvent = serde_json::from_str(&raw).unwrap();
            match event {
                ServerEvent::AudioDelta { item_id, delta } => {
                    assert_eq!(item_id, "item-1");
                    assert_eq!(ServerEvent::decode_delta(&delta).unwrap(), b"AA");
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_kind_is_ignored_not_error() {
        let raw = "{\"type\":\"rate_limits.updated\",\"rate_limits\":[]}";
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event, ServerEvent::Ignored);
    }

    #[test]
    fn error_event_message_from_either_field() {
        let nested: ServerEvent = serde_json::from_str(
            "{\"type\":\"error\",\"error\":{\"message\":\"too fast\"}}",
        )
        .unwrap();
        assert_eq!(nested.error_message(), Some("too fast"));

        let flat: ServerEvent =
            serde_json::from_str("{\"type\":\"error\",\"message\":\"oops\"}").unwrap();
        assert_eq!(flat.error_message(), Some("oops"));
    }

    #[test]
    fn session_created_carries_id() {
        let raw = "{\"type\":\"session.created\",\"session\":{\"id\":\"sess_42\",\"voice\":\"coral\"}}";
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::SessionCreated { session } => {
                assert_eq!(session.id.as_deref(), Some("sess_42"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bad_delta_payload_is_a_decode_error() {
        let err = ServerEvent::decode_delta("not base64!!").unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }
}
