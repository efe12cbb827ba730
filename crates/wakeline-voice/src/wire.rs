//! Abstract duplex message channel and its transports
//!
//! The core treats the realtime connection as an ordered text-message
//! channel. `WsChannel` is the production WebSocket transport; `pipe()`
//! builds an in-memory channel pair for tests.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Send half of an ordered duplex channel.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, text: String) -> VoiceResult<()>;
}

/// Receive half of an ordered duplex channel. `None` means the channel
/// closed; an `Err` item is a terminal transport fault.
#[async_trait]
pub trait MessageSource: Send {
    async fn next(&mut self) -> Option<VoiceResult<String>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport for the realtime channel.
pub struct WsChannel;

impl WsChannel {
    /// Connect and split into send/receive halves. When `api_key` is set,
    /// bearer auth and the realtime subprotocol headers are attached.
    pub async fn connect(
        url: &str,
        api_key: Option<&str>,
    ) -> VoiceResult<(WsSink, WsSource)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Channel(format!("bad endpoint {url}: {e}")))?;

        if let Some(key) = api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| VoiceError::Channel(format!("bad api key: {e}")))?;
            let headers = request.headers_mut();
            headers.insert("Authorization", bearer);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        info!("connecting realtime channel: {}", url);
        let (ws, _response) = connect_async(request).await?;
        info!("realtime channel connected");

        let (sink, stream) = ws.split();
        Ok((WsSink { inner: sink }, WsSource { inner: stream }))
    }
}

pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, text: String) -> VoiceResult<()> {
        self.inner.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

pub struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next(&mut self) -> Option<VoiceResult<String>> {
        loop {
            match self.inner.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!("channel close frame: {:?}", frame);
                    return None;
                }
                // Binary frames and control pings are not part of this
                // protocol; skip them.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }
}

/// In-memory channel endpoint for tests: a sink/source pair wired to the
/// peer endpoint.
pub struct PipeSink {
    tx: mpsc::Sender<String>,
}

pub struct PipeSource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl MessageSink for PipeSink {
    async fn send(&mut self, text: String) -> VoiceResult<()> {
        self.tx
            .send(text)
            .await
            .map_err(|_| VoiceError::ChannelClosed("pipe peer gone".into()))
    }
}

#[async_trait]
impl MessageSource for PipeSource {
    async fn next(&mut self) -> Option<VoiceResult<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Build a connected pair of in-memory endpoints `(client, server)`.
/// Dropping either endpoint's halves closes the peer's source, which the
/// session observes as connection loss.
pub fn pipe(capacity: usize) -> ((PipeSink, PipeSource), (PipeSink, PipeSource)) {
    let (client_tx, server_rx) = mpsc::channel(capacity.max(1));
    let (server_tx, client_rx) = mpsc::channel(capacity.max(1));

    (
        (PipeSink { tx: client_tx }, PipeSource { rx: client_rx }),
        (PipeSink { tx: server_tx }, PipeSource { rx: server_rx }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_round_trip() {
        let ((mut client_sink, mut client_source), (mut server_sink, mut server_source)) =
            pipe(4);

        client_sink.send("hello".into()).await.unwrap();
        assert_eq!(server_source.next().await.unwrap().unwrap(), "hello");

        server_sink.send("world".into()).await.unwrap();
        assert_eq!(client_source.next().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn dropping_peer_closes_source() {
        let ((client_sink, mut client_source), (server_sink, server_source)) = pipe(4);
        drop(server_sink);
        drop(server_source);

        assert!(client_source.next().await.is_none());
        drop(client_sink);
    }
}
