//! The cloud-side control channel.
//!
//! A bridge never talks to the WebSocket directly.  The connection is split
//! once into a [`ControlSource`] (read by the dispatcher) and a
//! [`ControlSink`] (written by exactly one task).  [`ChannelSink`] and
//! [`ChannelSource`] implement the same seams over in-process channels for
//! tests and for embedding a bridge without a network hop.

use std::time::Duration;

use async_trait::async_trait;
use fleetbridge_types::LinkError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a control channel.
#[async_trait]
pub trait ControlSink: Send {
    /// Send a JSON value as a text message.
    async fn send_json(&mut self, value: &Value) -> Result<(), LinkError>;

    /// Send raw bytes as a binary message.
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Close the channel.  Errors are ignored; calling it twice is harmless.
    async fn close(&mut self);
}

/// Inbound half of a control channel.
#[async_trait]
pub trait ControlSource: Send {
    /// Wait for the next text message.
    ///
    /// Returns `None` once the peer has closed the channel.  Non-text
    /// messages are skipped.  Cancel-safe: dropping the future never loses a
    /// message, so callers may wrap it in `tokio::time::timeout`.
    async fn next_text(&mut self) -> Option<Result<String, LinkError>>;
}

/// Connect to a control WebSocket and split it.
///
/// # Errors
///
/// [`LinkError::Connection`] if the handshake fails.
pub async fn connect_control(url: &str) -> Result<(WsSink, WsSource), LinkError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| LinkError::connection(url, e))?;
    debug!(url, "control channel connected");
    let (sink, source) = stream.split();
    Ok((
        WsSink {
            url: url.to_string(),
            inner: sink,
            closed: false,
        },
        WsSource {
            url: url.to_string(),
            inner: source,
        },
    ))
}

pub struct WsSink {
    url: String,
    inner: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl ControlSink for WsSink {
    async fn send_json(&mut self, value: &Value) -> Result<(), LinkError> {
        self.inner
            .send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| LinkError::connection(&self.url, e))
    }

    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), LinkError> {
        self.inner
            .send(Message::Binary(payload.into()))
            .await
            .map_err(|e| LinkError::connection(&self.url, e))
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.inner.close().await {
            debug!(url = %self.url, error = %e, "control channel close");
        }
    }
}

pub struct WsSource {
    url: String,
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl ControlSource for WsSource {
    async fn next_text(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(LinkError::connection(&self.url, e))),
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Keep reading a channel whose inbound messages the bridge has no use for.
///
/// The WebSocket only answers server pings and close frames while its read
/// half is polled, so an outbound-only channel still needs a reader.  Text
/// is logged and discarded.  Returns once `shutdown` is triggered or the
/// server closes the channel.
pub async fn drain_control(source: &mut dyn ControlSource, shutdown: &Shutdown, poll_interval: Duration) {
    while !shutdown.is_triggered() {
        match tokio::time::timeout(poll_interval, source.next_text()).await {
            Err(_) => continue,
            Ok(Some(Ok(text))) => debug!(bytes = text.len(), "ignoring inbound message"),
            Ok(Some(Err(e))) => {
                warn!(error = %e, "outbound-only channel failed");
                return;
            }
            Ok(None) => {
                info!("outbound-only channel closed by server");
                return;
            }
        }
    }
}

/// A message captured by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// [`ControlSink`] that forwards into an unbounded in-process channel.
///
/// Sends fail with [`LinkError::Connection`] once the receiver is dropped or
/// the sink has been closed.
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<ControlMessage>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    fn push(&self, message: ControlMessage) -> Result<(), LinkError> {
        self.tx
            .as_ref()
            .ok_or_else(|| LinkError::connection("in-process", "sink closed"))?
            .send(message)
            .map_err(|_| LinkError::connection("in-process", "receiver dropped"))
    }
}

#[async_trait]
impl ControlSink for ChannelSink {
    async fn send_json(&mut self, value: &Value) -> Result<(), LinkError> {
        self.push(ControlMessage::Text(value.to_string()))
    }

    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), LinkError> {
        self.push(ControlMessage::Binary(payload))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// [`ControlSource`] fed from an unbounded in-process channel.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl ControlSource for ChannelSource {
    async fn next_text(&mut self) -> Option<Result<String, LinkError>> {
        self.rx.recv().await.map(Ok)
    }
}
