//! Per-turn playback accumulation
//!
//! Reassembles streamed audio deltas into an ordered byte queue, one turn at
//! a time. A delta carrying a new item id switches the current turn and
//! resets the frame counter atomically, so the output queue never interleaves
//! two turns' audio. The dispatcher is the single producer; the output pump
//! is the single consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    current_item: Option<String>,
    /// Samples appended for the current turn only.
    frames: u64,
    queue: VecDeque<Vec<u8>>,
    turn_done: bool,
}

/// Accumulates `{item_id, bytes}` audio fragments per conversational turn.
#[derive(Debug, Default)]
pub struct PlaybackAccumulator {
    inner: Mutex<Inner>,
    data: Notify,
    drained: Notify,
}

impl PlaybackAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded audio delta. If `item_id` differs from the current
    /// turn, the queue and frame counter are reset and `item_id` becomes the
    /// current turn before the append. Returns true when the turn switched.
    pub fn push_delta(&self, item_id: &str, bytes: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().expect("playback lock");

        let switched = inner.current_item.as_deref() != Some(item_id);
        if switched {
            if let Some(old) = inner.current_item.take() {
                debug!("turn switch {} -> {}", old, item_id);
            }
            inner.current_item = Some(item_id.to_string());
            inner.frames = 0;
            inner.queue.clear();
            inner.turn_done = false;
        }

        inner.frames += (bytes.len() / 2) as u64;
        inner.queue.push_back(bytes);
        drop(inner);

        self.data.notify_one();
        switched
    }

    /// Consumer side: take the oldest queued chunk, if any.
    pub fn pop_chunk(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("playback lock");
        let chunk = inner.queue.pop_front();
        let empty = inner.queue.is_empty();
        drop(inner);

        // notify_one stores a permit, so a waiter registering after the
        // final pop still observes the drain.
        if chunk.is_some() && empty {
            self.drained.notify_one();
        }
        chunk
    }

    /// Consumer side: wait for the next chunk.
    pub async fn next_chunk(&self) -> Vec<u8> {
        loop {
            if let Some(chunk) = self.pop_chunk() {
                return chunk;
            }
            self.data.notified().await;
        }
    }

    /// True when the output queue has been fully consumed.
    pub fn is_drained(&self) -> bool {
        self.inner.lock().expect("playback lock").queue.is_empty()
    }

    /// Wait until the queue has been fully consumed.
    pub async fn wait_drained(&self) {
        loop {
            if self.is_drained() {
                return;
            }
            self.drained.notified().await;
        }
    }

    /// Mark the current turn's playback as logically complete
    /// (`response.done` arrived). The audio may still be draining.
    pub fn on_turn_done(&self) {
        self.inner.lock().expect("playback lock").turn_done = true;
    }

    /// True once `response.done` has been seen for the current turn.
    pub fn turn_done(&self) -> bool {
        self.inner.lock().expect("playback lock").turn_done
    }

    /// Discard everything queued (barge-in interruption). The current turn
    /// id is kept so late deltas for the interrupted turn still match.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("playback lock");
        inner.queue.clear();
        inner.frames = 0;
        drop(inner);
        self.drained.notify_one();
    }

    /// Current turn id, if any delta has arrived.
    pub fn current_item(&self) -> Option<String> {
        self.inner.lock().expect("playback lock").current_item.clone()
    }

    /// Samples appended for the current turn only; resets on turn switch.
    pub fn frames(&self) -> u64 {
        self.inner.lock().expect("playback lock").frames
    }
}
