//! Transport abstraction for client connections.
//!
//! The bus only needs "send a text frame" and "close"; the concrete carrier
//! is either a WebSocket stream or an in-process channel (tests, embedding).

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

/// Send half of a client connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame. A full outbound buffer is an error: the caller
    /// disconnects rather than block other recipients.
    async fn send_text(&self, text: String) -> Result<(), String>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Channel-backed transport with a bounded outbound buffer.
pub struct ChannelTransport {
    sender: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end observing its frames.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), String> {
        // try_send keeps back-pressure semantics: full buffer fails the send.
        self.sender
            .try_send(text)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => "outbound buffer full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "receiver dropped".to_string(),
            })
    }

    async fn close(&self) {
        // Dropping the sender closes the channel; nothing to do eagerly.
    }
}

/// WebSocket transport over the write half of an accepted stream.
pub struct WsTransport<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, WsFrame>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap the write half of a split WebSocket stream.
    pub fn new(sink: SplitSink<WebSocketStream<S>, WsFrame>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
        }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&self, text: String) -> Result<(), String> {
        let mut sink = self.sink.lock().await;
        sink.send(WsFrame::Text(text))
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsFrame::Close(None)).await;
    }
}
