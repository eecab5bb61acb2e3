//! WebSocket transport adapter.
//!
//! Owns the socket and nothing else: frames are decoded to typed events and
//! handed to the connection actor in arrival order; outbound frames are
//! written FIFO by a single writer task. Heartbeat handling lives here and is
//! stateless: a `test_request` is answered with a `public/test` frame stamped
//! from the shared id source at the moment it is observed, without touching
//! any higher layer. Plain heartbeats are swallowed.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    common::consts::METHOD_TEST,
    websocket::{
        error::DeribitWsError,
        messages::{DeribitWsEvent, JsonRpcRequest, NotificationKind},
        rpc::RequestIdGenerator,
    },
};

/// Why the transport went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the connection cleanly.
    Normal,
    /// The client asked for the close.
    ShuttingDown,
    /// Anything else: network failure, protocol error, abrupt EOF.
    Error(String),
}

/// Inbound push events delivered to the connection actor.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded frame (response or notification).
    Event(DeribitWsEvent),
    /// The frame was not valid JSON; the connection stays up.
    ParseError(String),
    /// The transport is gone; no further events follow.
    Closed(CloseReason),
}

/// A live WebSocket connection with reader and writer tasks.
#[derive(Debug)]
pub struct Transport {
    writer_tx: mpsc::UnboundedSender<Message>,
    shutting_down: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Opens the socket and spawns the I/O tasks.
    ///
    /// Inbound events flow into `events_tx` in arrival order until a
    /// [`TransportEvent::Closed`] terminates the stream.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::Transport`] when the connection cannot be
    /// established.
    pub async fn connect(
        url: &str,
        ids: RequestIdGenerator,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, DeribitWsError> {
        let (stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::debug!(
                        target: "deribit_client",
                        error = %e,
                        "Writer task stopping on send failure",
                    );
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader_writer_tx = writer_tx.clone();
        let reader_shutting_down = shutting_down.clone();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        Self::handle_text(&text, &ids, &reader_writer_tx, &events_tx);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = reader_writer_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(
                            target: "deribit_client",
                            frame = ?frame,
                            "Received close frame",
                        );
                        if reader_shutting_down.load(Ordering::Relaxed) {
                            break CloseReason::ShuttingDown;
                        }
                        break CloseReason::Normal;
                    }
                    Some(Err(e)) => {
                        if reader_shutting_down.load(Ordering::Relaxed) {
                            break CloseReason::ShuttingDown;
                        }
                        break CloseReason::Error(e.to_string());
                    }
                    None => {
                        if reader_shutting_down.load(Ordering::Relaxed) {
                            break CloseReason::ShuttingDown;
                        }
                        break CloseReason::Error("connection ended unexpectedly".to_string());
                    }
                }
            };
            let _ = events_tx.send(TransportEvent::Closed(reason));
        });

        Ok(Self {
            writer_tx,
            shutting_down,
            reader_task,
            writer_task,
        })
    }

    fn handle_text(
        text: &str,
        ids: &RequestIdGenerator,
        writer_tx: &mpsc::UnboundedSender<Message>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match serde_json::from_str::<DeribitWsEvent>(text) {
            Ok(DeribitWsEvent::Notification(notification)) => match notification.kind() {
                NotificationKind::TestRequest => {
                    let request = JsonRpcRequest::new(ids.next_id(), METHOD_TEST, json!({}));
                    match serde_json::to_string(&request) {
                        Ok(payload) => {
                            tracing::trace!(
                                target: "deribit_client",
                                id = request.id,
                                "Answering heartbeat test_request",
                            );
                            let _ = writer_tx.send(Message::Text(payload.into()));
                        }
                        Err(e) => tracing::error!(
                            target: "deribit_client",
                            error = %e,
                            "Failed to encode heartbeat response",
                        ),
                    }
                }
                NotificationKind::Heartbeat => {}
                _ => {
                    let _ = events_tx.send(TransportEvent::Event(DeribitWsEvent::Notification(
                        notification,
                    )));
                }
            },
            Ok(event) => {
                let _ = events_tx.send(TransportEvent::Event(event));
            }
            Err(e) => {
                let _ = events_tx.send(TransportEvent::ParseError(e.to_string()));
            }
        }
    }

    /// Queues a text frame; frames go out in queue order.
    ///
    /// # Errors
    ///
    /// Returns [`DeribitWsError::ConnectionClosed`] when the writer is gone.
    pub fn send_text(&self, text: String) -> Result<(), DeribitWsError> {
        self.writer_tx
            .send(Message::Text(text.into()))
            .map_err(|_| DeribitWsError::ConnectionClosed)
    }

    /// Requests a graceful close; the reader reports `ShuttingDown`.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let _ = self.writer_tx.send(Message::Close(None));
    }

    /// Tears the connection down without the closing handshake.
    pub fn abort(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
