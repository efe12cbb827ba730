//! Fan-in stream merger
//!
//! Turns a fixed set of named asynchronous sources into one tagged stream.
//! One task pumps each source into a shared bounded channel, so a fast
//! producer blocks on backpressure instead of dropping, every source's own
//! ordering is preserved, and interleaving reflects arrival order. The
//! merged stream ends when every source ends; a fatal source error is
//! forwarded once and shuts the other pumps down cooperatively.

use crate::error::VoiceError;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One item from one source, tagged with the source's label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEvent<L, T> {
    pub label: L,
    pub item: T,
}

/// Builder: register sources, then `build()` to start consuming.
pub struct MergerBuilder<L, T> {
    tx: mpsc::Sender<Result<MergedEvent<L, T>, VoiceError>>,
    rx: mpsc::Receiver<Result<MergedEvent<L, T>, VoiceError>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<L, T> MergerBuilder<L, T>
where
    L: Clone + std::fmt::Debug + Send + 'static,
    T: Send + 'static,
{
    /// `capacity` bounds the shared queue; producers block when it is full.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            rx,
            shutdown_tx,
        }
    }

    /// Register a source under `label` and start pumping it immediately.
    /// Each `Ok` item is forwarded tagged; the first `Err` is forwarded and
    /// terminates the whole merge.
    pub fn source<S>(self, label: L, stream: S) -> Self
    where
        S: Stream<Item = Result<T, VoiceError>> + Send + 'static,
    {
        let tx = self.tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            loop {
                let next = tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    next = stream.next() => next,
                };

                match next {
                    None => break,
                    Some(Ok(item)) => {
                        let event = MergedEvent {
                            label: label.clone(),
                            item,
                        };
                        // Stay responsive to shutdown while blocked on a
                        // full queue.
                        tokio::select! {
                            _ = shutdown_rx.wait_for(|stop| *stop) => break,
                            sent = tx.send(Ok(event)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
            debug!("merge pump for {:?} ended", label);
        });

        self
    }

    /// Finish registration. Dropping the builder's own sender lets the
    /// merged stream end once every pump ends.
    pub fn build(self) -> StreamMerger<L, T> {
        StreamMerger {
            rx: self.rx,
            shutdown_tx: self.shutdown_tx,
        }
    }
}

/// Consumer handle over the merged stream.
pub struct StreamMerger<L, T> {
    rx: mpsc::Receiver<Result<MergedEvent<L, T>, VoiceError>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<L, T> StreamMerger<L, T> {
    /// Next tagged item from any source. `None` once every source has ended
    /// (or shutdown drained the pumps).
    pub async fn next(&mut self) -> Option<Result<MergedEvent<L, T>, VoiceError>> {
        self.rx.recv().await
    }

    /// Cooperatively stop every pump. Each pump observes the signal at its
    /// next suspension point, including while blocked on backpressure or on
    /// its source.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A receiver other tasks can watch to observe shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl<L, T> Drop for StreamMerger<L, T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
