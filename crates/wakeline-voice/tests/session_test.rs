//! End-to-end session tests over an in-memory channel
//!
//! No audio hardware and no network: the microphone and scorer feeds are
//! plain channels, the realtime peer is scripted JSON, and the output device
//! records what it is asked to play.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use wakeline_voice::wire::{pipe, MessageSink, MessageSource, PipeSink, PipeSource};
use wakeline_voice::{
    AudioBlock, GateState, NullIndicator, NullTranscript, OutputDevice, ScoreMap, SessionConfig,
    SessionHandle, SessionIo, VoiceError, VoiceResult, VoiceSession, WakeWordScorer,
};

/// The scripted realtime peer.
struct Peer {
    sink: PipeSink,
    source: PipeSource,
}

impl Peer {
    async fn recv_json(&mut self) -> Value {
        let text = timeout(Duration::from_secs(2), self.source.next())
            .await
            .expect("no outbound event within 2s")
            .expect("channel closed")
            .expect("transport error");
        serde_json::from_str(&text).expect("outbound event is not JSON")
    }

    async fn send(&mut self, value: Value) {
        self.sink
            .send(value.to_string())
            .await
            .expect("session dropped its receive half");
    }
}

/// Scorer whose confidence is set by the test.
struct SharedScorer {
    label: String,
    level: Arc<Mutex<f32>>,
}

impl WakeWordScorer for SharedScorer {
    fn score(&mut self, _block: &AudioBlock) -> ScoreMap {
        let mut scores = ScoreMap::new();
        scores.insert(self.label.clone(), *self.level.lock().unwrap());
        scores
    }
}

/// Output device that records what it plays.
#[derive(Clone, Default)]
struct RecordingOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
    stops: Arc<AtomicUsize>,
}

impl OutputDevice for RecordingOutput {
    fn enqueue(&mut self, bytes: &[u8]) -> VoiceResult<()> {
        self.bytes.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        true
    }
}

struct Harness {
    handle: SessionHandle,
    peer: Peer,
    mic_tx: mpsc::Sender<VoiceResult<AudioBlock>>,
    scorer_tx: mpsc::Sender<VoiceResult<AudioBlock>>,
    level: Arc<Mutex<f32>>,
    output: RecordingOutput,
}

fn start(config: SessionConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ((client_sink, client_source), (server_sink, server_source)) = pipe(32);
    let (mic_tx, mic_rx) = mpsc::channel(32);
    let (scorer_tx, scorer_rx) = mpsc::channel(32);

    let level = Arc::new(Mutex::new(0.0f32));
    let output = RecordingOutput::default();

    let io = SessionIo {
        sink: Box::new(client_sink),
        source: Box::new(client_source),
        mic_rx,
        scorer_rx,
        scorer: Box::new(SharedScorer {
            label: config.trigger_label.clone(),
            level: Arc::clone(&level),
        }),
        output: Box::new(output.clone()),
        indicator: Arc::new(NullIndicator),
        display: Arc::new(NullTranscript),
    };

    let handle = VoiceSession::start(config, io).expect("session start");

    Harness {
        handle,
        peer: Peer {
            sink: server_sink,
            source: server_source,
        },
        mic_tx,
        scorer_tx,
        level,
        output,
    }
}

fn block(seq: u64) -> AudioBlock {
    AudioBlock {
        samples: vec![0i16; 320],
        sample_rate: 16000,
        seq,
    }
}

/// Complete the connect handshake: consume session.update, answer with
/// session.created, and wait for the session to report ready.
async fn handshake(h: &mut Harness) {
    let hello = h.peer.recv_json().await;
    assert_eq!(hello["type"], "session.update");
    assert_eq!(hello["session"]["turn_detection"]["type"], "server_vad");

    h.peer
        .send(json!({
            "type": "session.created",
            "session": { "id": "sess_test" }
        }))
        .await;
    timeout(Duration::from_secs(2), h.handle.ready())
        .await
        .expect("session never became ready")
        .expect("session ended before ready");
}

async fn next_transition(rx: &mut mpsc::UnboundedReceiver<GateState>) -> GateState {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no gate transition within 2s")
        .expect("gate transition channel closed")
}

/// Poll until `predicate` holds or two seconds pass.
async fn eventually(mut predicate: impl FnMut() -> bool, what: &str) {
    timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn long_debounce(mut config: SessionConfig) -> SessionConfig {
    // Keep the cooldown timer out of the picture for these scenarios.
    config.debounce = Duration::from_secs(600);
    config
}

#[tokio::test]
async fn wake_trigger_arms_cancels_once_and_opens_transmission() {
    let mut h = start(long_debounce(SessionConfig::desktop()));
    let mut transitions = h.handle.take_gate_transitions().unwrap();
    handshake(&mut h).await;

    // Dormant mic audio is never transmitted.
    h.mic_tx.send(Ok(block(0))).await.unwrap();

    *h.level.lock().unwrap() = 0.9;
    h.scorer_tx.send(Ok(block(0))).await.unwrap();

    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert_eq!(h.peer.recv_json().await["type"], "response.cancel");
    assert_eq!(h.output.stops.load(Ordering::SeqCst), 1);

    // A second trigger while armed refreshes the debounce, no second cancel.
    h.scorer_tx.send(Ok(block(1))).await.unwrap();

    // Armed mic audio flows; the very next outbound event is the append,
    // proving nothing (like a duplicate cancel) was sent in between.
    let samples = vec![0i16; 320];
    h.mic_tx.send(Ok(block(1))).await.unwrap();
    let append = h.peer.recv_json().await;
    assert_eq!(append["type"], "input_audio_buffer.append");
    let expected = B64.encode(
        samples
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect::<Vec<u8>>(),
    );
    assert_eq!(append["audio"], Value::String(expected));

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn new_turn_resets_playback_accumulation() {
    let mut h = start(SessionConfig::desktop());
    handshake(&mut h).await;

    // Two fragments for the first turn, then a delta carrying a new item id.
    for (item, payload) in [("item-1", b"AA"), ("item-1", b"BB"), ("item-2", b"CC")] {
        h.peer
            .send(json!({
                "type": "response.output_audio.delta",
                "item_id": item,
                "delta": B64.encode(payload),
            }))
            .await;
    }

    let playback = Arc::clone(h.handle.playback());
    eventually(
        || playback.current_item().as_deref() == Some("item-2"),
        "turn switch to item-2",
    )
    .await;
    // One 2-byte fragment for the new turn; nothing carried over.
    assert_eq!(playback.frames(), 1);

    let output = h.output.clone();
    eventually(
        || output.bytes.lock().unwrap().ends_with(b"CC"),
        "new turn audio reaching the device",
    )
    .await;

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn half_duplex_suspends_during_playback_and_rearms_after_drain() {
    let mut h = start(long_debounce(SessionConfig::headless()));
    let mut transitions = h.handle.take_gate_transitions().unwrap();
    handshake(&mut h).await;

    *h.level.lock().unwrap() = 0.9;
    h.scorer_tx.send(Ok(block(0))).await.unwrap();
    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert_eq!(h.peer.recv_json().await["type"], "response.cancel");

    // Synthesized audio arrives: the gate must go quiet so the device cannot
    // hear itself.
    *h.level.lock().unwrap() = 0.0;
    h.peer
        .send(json!({
            "type": "response.output_audio.delta",
            "item_id": "item-1",
            "delta": B64.encode(b"AABB"),
        }))
        .await;
    assert_eq!(next_transition(&mut transitions).await, GateState::Dormant);

    // Turn complete and queue drained: the gate re-arms on its own.
    h.peer.send(json!({ "type": "response.done" })).await;
    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert_eq!(h.handle.gate_state(), GateState::Armed);

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn server_vad_speech_interrupts_playback() {
    let mut h = start(SessionConfig::desktop());
    handshake(&mut h).await;

    h.peer
        .send(json!({
            "type": "response.output_audio.delta",
            "item_id": "item-1",
            "delta": B64.encode(b"AABBCCDD"),
        }))
        .await;
    h.peer
        .send(json!({ "type": "input_audio_buffer.speech_started" }))
        .await;

    let output = h.output.clone();
    eventually(
        || output.stops.load(Ordering::SeqCst) >= 1,
        "playback stop on speech",
    )
    .await;
    let playback = Arc::clone(h.handle.playback());
    eventually(|| playback.is_drained(), "queue cleared on speech").await;

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn push_to_talk_arms_and_disarms() {
    let mut h = start(long_debounce(SessionConfig::desktop()));
    let mut transitions = h.handle.take_gate_transitions().unwrap();
    handshake(&mut h).await;

    h.handle.enable().await.unwrap();
    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert_eq!(h.peer.recv_json().await["type"], "response.cancel");

    h.handle.disable();
    assert_eq!(next_transition(&mut transitions).await, GateState::Dormant);
    assert_eq!(h.handle.gate_state(), GateState::Dormant);

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn channel_close_ends_the_session() {
    let mut h = start(SessionConfig::desktop());
    handshake(&mut h).await;

    // The peer goes away; mic and scorer feeds are still open, yet the
    // whole session must still wind down promptly.
    drop(h.peer);

    let result = timeout(Duration::from_secs(5), h.handle.join())
        .await
        .expect("session did not end after channel close");
    assert!(matches!(result, Err(VoiceError::ChannelClosed(_))));
}

#[tokio::test]
async fn trigger_before_session_ready_sends_nothing() {
    let mut h = start(long_debounce(SessionConfig::desktop()));
    let mut transitions = h.handle.take_gate_transitions().unwrap();

    let hello = h.peer.recv_json().await;
    assert_eq!(hello["type"], "session.update");

    // Wake trigger before session.created: the gate arms locally but no
    // event may reach the wire.
    *h.level.lock().unwrap() = 0.9;
    h.scorer_tx.send(Ok(block(0))).await.unwrap();
    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert!(
        timeout(Duration::from_millis(200), h.peer.source.next())
            .await
            .is_err(),
        "event sent before session.created"
    );

    h.peer
        .send(json!({
            "type": "session.created",
            "session": { "id": "sess_test" }
        }))
        .await;
    timeout(Duration::from_secs(2), h.handle.ready())
        .await
        .expect("session never became ready")
        .expect("session ended before ready");

    // A fresh Armed period after readiness cancels normally.
    h.handle.disable();
    assert_eq!(next_transition(&mut transitions).await, GateState::Dormant);
    h.scorer_tx.send(Ok(block(1))).await.unwrap();
    assert_eq!(next_transition(&mut transitions).await, GateState::Armed);
    assert_eq!(h.peer.recv_json().await["type"], "response.cancel");

    h.handle.shutdown();
    let _ = h.handle.join().await;
}

#[tokio::test]
async fn unknown_server_events_are_tolerated() {
    let mut h = start(SessionConfig::desktop());
    handshake(&mut h).await;

    h.peer
        .send(json!({ "type": "rate_limits.updated", "rate_limits": [] }))
        .await;
    h.peer
        .send(json!({
            "type": "response.output_audio.delta",
            "item_id": "item-1",
            "delta": B64.encode(b"AA"),
        }))
        .await;

    // The unknown event before it did not wedge or kill the session.
    let playback = Arc::clone(h.handle.playback());
    eventually(
        || playback.current_item().as_deref() == Some("item-1"),
        "delta after unknown event",
    )
    .await;

    h.handle.shutdown();
    let _ = h.handle.join().await;
}
