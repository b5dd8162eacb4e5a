//! Signaling channel to the relay
//!
//! The relay is an opaque bidirectional JSON bus. A [`SignalingConnector`]
//! opens one [`SignalingLink`] per connection attempt; the call loop drops the
//! link and asks for a new one whenever the channel dies.

use super::SignalMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Time a closing link has to flush before its tasks are aborted
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Something that happened on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Inbound message
    Message(SignalMessage),
    /// The channel closed, with a reason when one is known
    Closed(Option<String>),
}

/// Outbound command for the writer side of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(SignalMessage),
    Close,
}

/// One open connection to the relay
///
/// Dropping the link aborts its background tasks.
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingLink {
    /// Assemble a link from its channel halves and the tasks serving them
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            events,
            tasks,
        }
    }

    /// Queue a message for the relay
    pub fn send(&self, message: SignalMessage) -> Result<()> {
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| Error::ChannelClosed("signaling link is closed".to_string()))
    }

    /// Next event; a link whose event source is gone reports `Closed`
    pub async fn next_event(&mut self) -> ChannelEvent {
        self.events
            .recv()
            .await
            .unwrap_or(ChannelEvent::Closed(None))
    }

    /// Flush queued messages and close the channel
    ///
    /// The tasks serving the link get [`CLOSE_GRACE`] to finish before they
    /// are aborted.
    pub fn close(mut self) {
        let _ = self.outbound.send(Outbound::Close);
        let tasks = std::mem::take(&mut self.tasks);
        if tasks.is_empty() {
            return;
        }

        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            for task in tasks {
                task.abort();
            }
        });
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens connections to the relay
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingLink>;
}

/// WebSocket relay connector
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// # Arguments
    ///
    /// * `url` - WebSocket signaling relay URL (ws:// or wss://)
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Writer task: serializes queued messages onto the socket
    async fn writer_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Message(message) => match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!("Failed to serialize {} message: {}", message.kind(), e);
                        continue;
                    }
                },
                Outbound::Close => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            };

            if let Err(e) = write.send(frame).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        debug!("Writer task terminated");
    }

    /// Reader task: parses inbound frames into channel events
    async fn reader_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(message) => {
                        if events.send(ChannelEvent::Message(message)).is_err() {
                            break None;
                        }
                    }
                    Err(e) => warn!("Dropping malformed signaling message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket connection closed by relay");
                    break frame.map(|f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break Some(e.to_string());
                }
                None => break None,
            }
        };

        let _ = events.send(ChannelEvent::Closed(reason));
        debug!("Reader task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingLink> {
        info!("Connecting to signaling relay: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(Self::writer_task(write, outbound_rx));
        let reader = tokio::spawn(Self::reader_task(read, events_tx));

        Ok(SignalingLink::new(
            outbound_tx,
            events_rx,
            vec![writer, reader],
        ))
    }
}
