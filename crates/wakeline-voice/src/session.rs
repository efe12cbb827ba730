//! Voice session orchestration
//!
//! One task owns all session state. Every input — microphone blocks, scorer
//! blocks, parsed channel events, gate timer expiries — arrives through a
//! single [`StreamMerger`], so the dispatcher never races itself: gate
//! decisions, playback accumulation and protocol sends are serialized by
//! construction, not by locks.
//!
//! ```text
//!  mic ----\
//!  scorer ---> StreamMerger ---> dispatcher ---> ProtocolSession --> sink
//!  channel -/        ^              |  \
//!  timer --/         |              |   '--> PlaybackAccumulator --> output pump
//!                    '--- gate timers
//! ```

use crate::audio::{AudioBlock, OutputDevice};
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::gate::{AudioGate, GateState, Route, TimerFire};
use crate::indicator::{Indicator, TranscriptSink};
use crate::merge::{MergedEvent, MergerBuilder, StreamMerger};
use crate::playback::PlaybackAccumulator;
use crate::protocol::{
    event_stream, ClientEvent, ProtocolHandle, ProtocolSession, ServerEvent, SessionUpdate,
};
use crate::wake::WakeWordScorer;
use crate::wire::{MessageSink, MessageSource};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Identifies which source produced a merged item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLabel {
    Mic,
    Scorer,
    Channel,
    Timer,
}

/// Payload of one merged item.
#[derive(Debug)]
enum Payload {
    Mic(AudioBlock),
    Scorer(AudioBlock),
    Channel(ServerEvent),
    Timer(TimerFire),
}

/// Everything the session needs from the outside world. Each field is a
/// seam: production wires hardware and a WebSocket, tests wire channels.
pub struct SessionIo {
    /// Send half of the realtime channel.
    pub sink: Box<dyn MessageSink>,
    /// Receive half of the realtime channel.
    pub source: Box<dyn MessageSource>,
    /// Microphone blocks at the transmission rate.
    pub mic_rx: mpsc::Receiver<VoiceResult<AudioBlock>>,
    /// Microphone blocks at the scorer rate.
    pub scorer_rx: mpsc::Receiver<VoiceResult<AudioBlock>>,
    /// Wake-word scorer consuming the scorer feed.
    pub scorer: Box<dyn WakeWordScorer>,
    /// Playback device for synthesized audio.
    pub output: Box<dyn OutputDevice>,
    /// Arm/disarm indicator.
    pub indicator: Arc<dyn Indicator>,
    /// Transcript and status display.
    pub display: Arc<dyn TranscriptSink>,
}

/// A running voice session.
pub struct VoiceSession;

impl VoiceSession {
    /// Validate the configuration, wire the pipeline and start the session
    /// task. The session runs until the channel closes, a source fails, or
    /// [`SessionHandle::shutdown`] is called.
    pub fn start(config: SessionConfig, io: SessionIo) -> VoiceResult<SessionHandle> {
        config.validate()?;

        let SessionIo {
            sink,
            source,
            mic_rx,
            scorer_rx,
            scorer,
            output,
            indicator,
            display,
        } = io;

        let (timer_tx, timer_rx) = mpsc::channel::<TimerFire>(8);
        let (gate, gate_states) = AudioGate::new(&config, indicator, timer_tx);

        let hello = SessionUpdate::from_config(&config);
        let (protocol, ready_tx, writer) = ProtocolSession::start(sink, hello);

        let playback = Arc::new(PlaybackAccumulator::new());
        let output = Arc::new(Mutex::new(output));

        let merger = MergerBuilder::new(64)
            .source(SourceLabel::Mic, ReceiverStream::new(mic_rx).map(|r| r.map(Payload::Mic)))
            .source(
                SourceLabel::Scorer,
                ReceiverStream::new(scorer_rx).map(|r| r.map(Payload::Scorer)),
            )
            .source(
                SourceLabel::Channel,
                // A closed channel must end the whole session, not just this
                // source; the trailing error triggers the merger's shutdown
                // broadcast.
                event_stream(source)
                    .map(|r| r.map(Payload::Channel))
                    .chain(futures::stream::once(async {
                        Err(VoiceError::ChannelClosed("realtime channel closed".into()))
                    })),
            )
            .source(
                SourceLabel::Timer,
                ReceiverStream::new(timer_rx).map(|fire| Ok(Payload::Timer(fire))),
            )
            .build();

        // Output pump: the single consumer of the playback queue.
        let pump_playback = Arc::clone(&playback);
        let pump_output = Arc::clone(&output);
        let mut pump_stop = merger.shutdown_signal();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = pump_stop.wait_for(|stop| *stop) => break,
                    chunk = pump_playback.next_chunk() => chunk,
                };
                let result = pump_output.lock().expect("output lock").enqueue(&chunk);
                if let Err(e) = result {
                    warn!("playback enqueue failed: {}", e);
                }
            }
            debug!("output pump ended");
        });

        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run_dispatcher(
            config,
            merger,
            Arc::clone(&gate),
            protocol.clone(),
            ready_tx,
            Arc::clone(&playback),
            Arc::clone(&output),
            scorer,
            display,
            stop_rx,
            writer,
        ));

        Ok(SessionHandle {
            gate,
            playback,
            protocol,
            output,
            stop_tx,
            gate_states: Some(gate_states),
            task,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_dispatcher(
    config: SessionConfig,
    mut merger: StreamMerger<SourceLabel, Payload>,
    gate: Arc<AudioGate>,
    protocol: ProtocolHandle,
    ready_tx: watch::Sender<bool>,
    playback: Arc<PlaybackAccumulator>,
    output: Arc<Mutex<Box<dyn OutputDevice>>>,
    mut scorer: Box<dyn WakeWordScorer>,
    display: Arc<dyn TranscriptSink>,
    mut stop_rx: watch::Receiver<bool>,
    writer: JoinHandle<VoiceResult<()>>,
) -> VoiceResult<()> {
    let mut transcripts: HashMap<String, String> = HashMap::new();
    let mut result = Ok(());

    loop {
        let event = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => {
                info!("session shutdown requested");
                break;
            }
            event = merger.next() => event,
        };

        let MergedEvent { label: _, item } = match event {
            None => {
                info!("all session sources ended");
                break;
            }
            Some(Err(e)) => {
                error!("session source failed: {}", e);
                result = Err(e);
                break;
            }
            Some(Ok(event)) => event,
        };

        match item {
            Payload::Mic(block) => {
                if gate.route() != Route::Session {
                    continue;
                }
                // Until session.created arrives the server has no session to
                // append into; drop rather than stall the merged loop.
                if !protocol.is_ready() {
                    continue;
                }
                protocol
                    .send(ClientEvent::audio_append(&block.to_pcm16le()))
                    .await?;
            }

            Payload::Scorer(block) => {
                let scores = scorer.score(&block);
                if gate.on_scores(&scores) {
                    // Entering Armed interrupts whatever is playing.
                    playback.clear();
                    output.lock().expect("output lock").stop();
                    // Before session.created there is no response to cancel;
                    // nothing may go on the wire pre-ready.
                    if protocol.is_ready() {
                        protocol.send(ClientEvent::ResponseCancel {}).await?;
                    } else {
                        debug!("armed before session ready; cancel suppressed");
                    }
                }
            }

            Payload::Timer(fire) => gate.on_timer(fire),

            Payload::Channel(event) => {
                dispatch_server_event(
                    event,
                    &config,
                    &gate,
                    &ready_tx,
                    &playback,
                    &output,
                    &display,
                    &mut transcripts,
                );
            }
        }
    }

    merger.shutdown();
    drop(protocol);
    if let Ok(Err(e)) = writer.await {
        warn!("protocol writer failed: {}", e);
        if result.is_ok() {
            result = Err(e);
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn dispatch_server_event(
    event: ServerEvent,
    config: &SessionConfig,
    gate: &Arc<AudioGate>,
    ready_tx: &watch::Sender<bool>,
    playback: &Arc<PlaybackAccumulator>,
    output: &Arc<Mutex<Box<dyn OutputDevice>>>,
    display: &Arc<dyn TranscriptSink>,
    transcripts: &mut HashMap<String, String>,
) {
    match event {
        ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
            let id = session.id.as_deref().unwrap_or("unknown");
            info!("session ready: {}", id);
            display.session_ready(id);
            let _ = ready_tx.send(true);
        }

        ServerEvent::AudioDelta { item_id, delta } => {
            let bytes = match ServerEvent::decode_delta(&delta) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("dropping bad audio delta for {}: {}", item_id, e);
                    return;
                }
            };
            let switched = playback.push_delta(&item_id, bytes);
            if switched {
                transcripts.retain(|id, _| id == &item_id);
            }
            if config.half_duplex {
                gate.suspend();
            }
        }

        ServerEvent::TranscriptDelta { item_id, delta } => {
            let text = transcripts.entry(item_id.clone()).or_default();
            text.push_str(&delta);
            display.transcript(&item_id, text);
        }

        ServerEvent::SpeechStarted {} => {
            // Server VAD heard the user over playback: barge-in.
            debug!("speech started, interrupting playback");
            playback.clear();
            output.lock().expect("output lock").stop();
        }

        ServerEvent::ResponseDone {} => {
            playback.on_turn_done();
            if config.half_duplex {
                // Re-arm only after the last queued byte has been consumed.
                let playback = Arc::clone(playback);
                let gate = Arc::clone(gate);
                tokio::spawn(async move {
                    playback.wait_drained().await;
                    gate.resume();
                });
            }
        }

        ServerEvent::Error { .. } => {
            error!(
                "server error: {}",
                event.error_message().unwrap_or("unknown")
            );
        }

        ServerEvent::Ignored => {}
    }
}

/// External control surface for a running session.
pub struct SessionHandle {
    gate: Arc<AudioGate>,
    playback: Arc<PlaybackAccumulator>,
    protocol: ProtocolHandle,
    output: Arc<Mutex<Box<dyn OutputDevice>>>,
    stop_tx: watch::Sender<bool>,
    gate_states: Option<mpsc::UnboundedReceiver<GateState>>,
    task: JoinHandle<VoiceResult<()>>,
}

impl SessionHandle {
    /// Arm the gate externally (push-to-talk). Interrupts playback the same
    /// way a wake trigger would.
    pub async fn enable(&self) -> VoiceResult<()> {
        if self.gate.enable() {
            self.playback.clear();
            self.output.lock().expect("output lock").stop();
            if self.protocol.is_ready() {
                self.protocol.send(ClientEvent::ResponseCancel {}).await?;
            }
        }
        Ok(())
    }

    /// Force the gate dormant, cancelling any pending debounce.
    pub fn disable(&self) {
        self.gate.disable();
    }

    /// Ask the server to produce a response now, without waiting for VAD.
    pub async fn create_response(&self) -> VoiceResult<()> {
        self.protocol.send(ClientEvent::ResponseCreate {}).await
    }

    /// Wait until the server has acknowledged the session with
    /// `session.created`. Errors if the session ends first.
    pub async fn ready(&mut self) -> VoiceResult<()> {
        self.protocol.ready().await
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Stream of gate transitions, in order. Takeable once.
    pub fn take_gate_transitions(&mut self) -> Option<mpsc::UnboundedReceiver<GateState>> {
        self.gate_states.take()
    }

    pub fn playback(&self) -> &Arc<PlaybackAccumulator> {
        &self.playback
    }

    /// Request cooperative shutdown. Every pump and the dispatcher observe
    /// the signal at their next suspension point.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the session task to finish. Dropping the handle instead
    /// requests shutdown; `join` keeps the session running until it ends on
    /// its own.
    pub async fn join(self) -> VoiceResult<()> {
        let SessionHandle {
            task,
            stop_tx,
            protocol,
            ..
        } = self;
        // Fields bound by `..` live until end of scope, which would hold the
        // protocol sender open while the dispatcher waits for the writer to
        // see it close; shed it before awaiting the task.
        drop(protocol);
        let result = task
            .await
            .map_err(|e| VoiceError::Channel(format!("session task panicked: {e}")))?;
        drop(stop_tx);
        result
    }
}
