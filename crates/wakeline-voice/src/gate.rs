//! Audio gate: the Dormant/Armed debounce state machine
//!
//! Decides whether captured audio is transmitted (conversation mode) or
//! only scored for the wake word (listening mode). All state — the current
//! `GateState`, the timer generation and the cancel latch — changes under a
//! single critical section, so a trigger arriving mid-transition can never
//! start two overlapping cooldown timers. Timers are invalidated by bumping
//! the generation; a stale fire is a no-op, not an error.

use crate::config::SessionConfig;
use crate::indicator::Indicator;
use crate::wake::ScoreMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Gate state. `Cooldown` is the transition edge taken when the debounce
/// timer expires an Armed period; it is observable on the transition stream
/// but never rests between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Listening mode: blocks are scored, not transmitted.
    Dormant,
    /// Conversation mode: blocks are transmitted to the session.
    Armed,
    /// Debounce expired, returning to Dormant.
    Cooldown,
}

/// Where the gate routes a captured block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the protocol session.
    Session,
    /// Listening mode: only the wake-word scorer sees audio.
    Scorer,
}

/// A cooldown timer expiry, tagged with the generation it was scheduled
/// under. Delivered through the merger under the `timer` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    pub generation: u64,
}

#[derive(Debug)]
struct GateInner {
    state: GateState,
    generation: u64,
    /// At most one response.cancel per Armed period.
    cancel_sent: bool,
    /// Half-duplex: forced dormant while playback is queued.
    suspended: bool,
    suspended_was_armed: bool,
}

/// The gate state machine. Shared between the dispatcher and any external
/// toggles (push-to-talk key, playback policy).
pub struct AudioGate {
    trigger_label: String,
    threshold: f32,
    debounce: Duration,
    indicator: Arc<dyn Indicator>,
    timer_tx: mpsc::Sender<TimerFire>,
    state_tx: mpsc::UnboundedSender<GateState>,
    inner: Mutex<GateInner>,
}

impl AudioGate {
    /// Create a gate. `timer_tx` carries debounce expiries back into the
    /// session's merged loop. The returned receiver observes every state
    /// transition in order.
    pub fn new(
        config: &SessionConfig,
        indicator: Arc<dyn Indicator>,
        timer_tx: mpsc::Sender<TimerFire>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GateState>) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();

        let gate = Arc::new(Self {
            trigger_label: config.trigger_label.clone(),
            threshold: config.trigger_threshold,
            debounce: config.debounce,
            indicator,
            timer_tx,
            state_tx,
            inner: Mutex::new(GateInner {
                state: GateState::Dormant,
                generation: 0,
                cancel_sent: false,
                suspended: false,
                suspended_was_armed: false,
            }),
        });

        (gate, state_rx)
    }

    pub fn state(&self) -> GateState {
        self.inner.lock().expect("gate lock").state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("gate lock").generation
    }

    /// Routing decision for the current state.
    pub fn route(&self) -> Route {
        match self.state() {
            GateState::Armed | GateState::Cooldown => Route::Session,
            GateState::Dormant => Route::Scorer,
        }
    }

    /// Consume a scorer report. Returns true when a `response.cancel` must
    /// be sent now (entered Armed; barge-in on whatever is playing).
    pub fn on_scores(&self, scores: &ScoreMap) -> bool {
        let triggered = scores
            .get(&self.trigger_label)
            .map(|score| *score > self.threshold)
            .unwrap_or(false);
        if !triggered {
            return false;
        }

        let mut inner = self.inner.lock().expect("gate lock");
        if inner.suspended {
            // Half-duplex: the device must not trigger on its own voice.
            return false;
        }

        match inner.state {
            GateState::Dormant => {
                inner.state = GateState::Armed;
                inner.generation += 1;
                let send_cancel = !inner.cancel_sent;
                inner.cancel_sent = true;
                let generation = inner.generation;
                drop(inner);

                info!("wake word detected, gate armed");
                self.indicator.on();
                self.emit(GateState::Armed);
                self.schedule_timer(generation);
                send_cancel
            }
            GateState::Armed | GateState::Cooldown => {
                // Re-trigger: refresh the timer under a fresh generation so
                // continuous speech is not cut off mid-sentence.
                inner.generation += 1;
                let generation = inner.generation;
                drop(inner);

                debug!("re-trigger while armed, debounce refreshed");
                self.schedule_timer(generation);
                false
            }
        }
    }

    /// Explicit external arm (push-to-talk). Same effect as a wake trigger.
    pub fn enable(&self) -> bool {
        let mut scores = ScoreMap::new();
        scores.insert(self.trigger_label.clone(), 1.0);
        self.on_scores(&scores)
    }

    /// Explicit external disarm: force Dormant immediately and invalidate
    /// any pending timer.
    pub fn disable(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        inner.generation += 1;
        inner.cancel_sent = false;
        inner.suspended_was_armed = false;
        let was_armed = inner.state != GateState::Dormant;
        inner.state = GateState::Dormant;
        drop(inner);

        if was_armed {
            info!("gate disabled");
            self.indicator.off();
            self.emit(GateState::Dormant);
        }
    }

    /// Deliver a timer expiry. A fire whose generation does not match the
    /// current one was superseded and is a no-op.
    pub fn on_timer(&self, fire: TimerFire) {
        let mut inner = self.inner.lock().expect("gate lock");
        if fire.generation != inner.generation {
            debug!(
                "stale timer fire (gen {} != {})",
                fire.generation, inner.generation
            );
            return;
        }
        if inner.state != GateState::Armed {
            return;
        }

        inner.state = GateState::Dormant;
        inner.cancel_sent = false;
        drop(inner);

        info!("debounce elapsed, gate dormant");
        self.emit(GateState::Cooldown);
        self.indicator.off();
        self.emit(GateState::Dormant);
    }

    /// Half-duplex policy: force Dormant while playback audio is queued.
    /// Remembers whether the gate was armed so `resume` can restore it.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        if inner.suspended {
            return;
        }
        inner.suspended = true;
        inner.suspended_was_armed = inner.state == GateState::Armed;
        inner.generation += 1;
        let was_armed = inner.state == GateState::Armed;
        inner.state = GateState::Dormant;
        drop(inner);

        if was_armed {
            debug!("gate suspended for playback");
            self.indicator.off();
            self.emit(GateState::Dormant);
        }
    }

    /// Half-duplex policy: playback finished and drained. Restores Armed if
    /// the gate was armed when suspended; no new cancel is sent for the
    /// restored period.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        if !inner.suspended {
            return;
        }
        inner.suspended = false;
        let rearm = inner.suspended_was_armed;
        inner.suspended_was_armed = false;

        if !rearm {
            return;
        }
        inner.state = GateState::Armed;
        inner.generation += 1;
        inner.cancel_sent = true;
        let generation = inner.generation;
        drop(inner);

        debug!("gate resumed after playback drain");
        self.indicator.on();
        self.emit(GateState::Armed);
        self.schedule_timer(generation);
    }

    fn schedule_timer(&self, generation: u64) {
        let timer_tx = self.timer_tx.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = timer_tx.send(TimerFire { generation }).await;
        });
    }

    fn emit(&self, state: GateState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::NullIndicator;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(debounce_ms: u64) -> SessionConfig {
        let mut config = SessionConfig::desktop();
        config.debounce = Duration::from_millis(debounce_ms);
        config
    }

    fn trigger() -> ScoreMap {
        let mut scores = ScoreMap::new();
        scores.insert("hey_jarvis".to_string(), 0.9);
        scores
    }

    /// Route timer fires straight back into the gate, as the session's
    /// merged loop would.
    fn pump_timers(gate: Arc<AudioGate>, mut timer_rx: mpsc::Receiver<TimerFire>) {
        tokio::spawn(async move {
            while let Some(fire) = timer_rx.recv().await {
                gate.on_timer(fire);
            }
        });
    }

    async fn collect_states(
        rx: &mut mpsc::UnboundedReceiver<GateState>,
        n: usize,
    ) -> Vec<GateState> {
        let mut states = Vec::new();
        for _ in 0..n {
            let state = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("state transition timed out")
                .expect("state channel closed");
            states.push(state);
        }
        states
    }

    #[tokio::test]
    async fn trigger_then_silence_walks_full_sequence() {
        let (timer_tx, timer_rx) = mpsc::channel(4);
        let (gate, mut states) =
            AudioGate::new(&test_config(50), Arc::new(NullIndicator), timer_tx);
        pump_timers(Arc::clone(&gate), timer_rx);

        assert_eq!(gate.state(), GateState::Dormant);
        assert_eq!(gate.route(), Route::Scorer);

        let send_cancel = gate.on_scores(&trigger());
        assert!(send_cancel, "first arm sends exactly one cancel");
        assert_eq!(gate.route(), Route::Session);

        let observed = collect_states(&mut states, 3).await;
        assert_eq!(
            observed,
            vec![GateState::Armed, GateState::Cooldown, GateState::Dormant]
        );
        assert_eq!(gate.state(), GateState::Dormant);
    }

    #[tokio::test]
    async fn below_threshold_scores_do_not_arm() {
        let (timer_tx, _timer_rx) = mpsc::channel(4);
        let (gate, _states) =
            AudioGate::new(&test_config(50), Arc::new(NullIndicator), timer_tx);

        let mut scores = ScoreMap::new();
        scores.insert("hey_jarvis".to_string(), 0.4);
        assert!(!gate.on_scores(&scores));
        assert_eq!(gate.state(), GateState::Dormant);

        // Wrong label, high score: still dormant.
        let mut scores = ScoreMap::new();
        scores.insert("ok_computer".to_string(), 0.9);
        assert!(!gate.on_scores(&scores));
        assert_eq!(gate.state(), GateState::Dormant);
    }

    #[tokio::test]
    async fn retrigger_refreshes_timer_and_sends_no_second_cancel() {
        let (timer_tx, timer_rx) = mpsc::channel(4);
        let (gate, mut states) =
            AudioGate::new(&test_config(100), Arc::new(NullIndicator), timer_tx);
        pump_timers(Arc::clone(&gate), timer_rx);

        assert!(gate.on_scores(&trigger()));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Re-trigger before the first timer fires.
        assert!(!gate.on_scores(&trigger()));

        // The original deadline passes; the stale fire must not disarm.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gate.state(), GateState::Armed);

        // The refreshed deadline eventually fires.
        let observed = collect_states(&mut states, 3).await;
        assert_eq!(
            observed,
            vec![GateState::Armed, GateState::Cooldown, GateState::Dormant]
        );
    }

    #[tokio::test]
    async fn stale_generation_fire_is_noop() {
        let (timer_tx, _timer_rx) = mpsc::channel(4);
        let (gate, _states) =
            AudioGate::new(&test_config(60_000), Arc::new(NullIndicator), timer_tx);

        assert!(gate.on_scores(&trigger()));
        let old_generation = gate.generation();
        assert!(!gate.on_scores(&trigger())); // refresh, new generation

        gate.on_timer(TimerFire {
            generation: old_generation,
        });
        assert_eq!(gate.state(), GateState::Armed);
    }

    #[tokio::test]
    async fn disable_forces_dormant_and_invalidates_timer() {
        let (timer_tx, _timer_rx) = mpsc::channel(4);
        let (gate, _states) =
            AudioGate::new(&test_config(60_000), Arc::new(NullIndicator), timer_tx);

        assert!(gate.on_scores(&trigger()));
        let generation = gate.generation();
        gate.disable();
        assert_eq!(gate.state(), GateState::Dormant);

        // The pending fire is stale after disable.
        gate.on_timer(TimerFire { generation });
        assert_eq!(gate.state(), GateState::Dormant);

        // Next arm starts a fresh cancel period.
        assert!(gate.on_scores(&trigger()));
    }

    #[tokio::test]
    async fn suspend_blocks_triggers_and_resume_restores_armed() {
        let (timer_tx, _timer_rx) = mpsc::channel(4);
        let (gate, _states) =
            AudioGate::new(&test_config(60_000), Arc::new(NullIndicator), timer_tx);

        assert!(gate.on_scores(&trigger()));
        gate.suspend();
        assert_eq!(gate.state(), GateState::Dormant);

        // The device's own voice must not re-arm the gate.
        assert!(!gate.on_scores(&trigger()));
        assert_eq!(gate.state(), GateState::Dormant);

        gate.resume();
        assert_eq!(gate.state(), GateState::Armed);
    }

    #[tokio::test]
    async fn resume_from_dormant_stays_listening() {
        let (timer_tx, _timer_rx) = mpsc::channel(4);
        let (gate, _states) =
            AudioGate::new(&test_config(60_000), Arc::new(NullIndicator), timer_tx);

        gate.suspend();
        gate.resume();
        assert_eq!(gate.state(), GateState::Dormant);
        assert_eq!(gate.route(), Route::Scorer);
    }
}
