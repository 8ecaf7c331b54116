use crate::error::{Error, Result};
use crate::event::{EventSender, SessionEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Negotiation data exchanged between two peers. The coordinator and the
/// relay only carry it; the transport is the one that interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// One relay frame. Serialized as `{"event": "...", "data": {...}}`, the
/// `data` objects keep the relay's field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayMessage {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        username: String,
    },
    UserConnected {
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
    },
    UserDisconnected {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Outbound `user_id` is the recipient; inbound it is the sender.
    Signal {
        #[serde(rename = "userId")]
        user_id: String,
        signal: SignalPayload,
    },
}

impl RelayMessage {
    /// Inbound frames the coordinator cares about. `join-room` only ever
    /// travels client to relay.
    pub fn into_event(self) -> Option<SessionEvent> {
        match self {
            RelayMessage::UserConnected { user_id, username } => {
                Some(SessionEvent::UserConnected { user_id, username })
            }
            RelayMessage::UserDisconnected { user_id } => {
                Some(SessionEvent::UserDisconnected { user_id })
            }
            RelayMessage::Signal { user_id, signal } => Some(SessionEvent::Signal {
                from: user_id,
                payload: signal,
            }),
            RelayMessage::JoinRoom { .. } => None,
        }
    }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: RelayMessage) -> Result<()>;

    /// Closes the relay connection. No `SignalingLost` is reported for a
    /// disconnect the session asked for.
    async fn disconnect(&mut self) -> Result<()>;

    async fn join_room(&self, room_id: &str, username: &str) -> Result<()> {
        self.send(RelayMessage::JoinRoom {
            room_id: room_id.to_string(),
            username: username.to_string(),
        })
        .await
    }

    async fn send_signal(&self, to: &str, payload: SignalPayload) -> Result<()> {
        self.send(RelayMessage::Signal {
            user_id: to.to_string(),
            signal: payload,
        })
        .await
    }
}

/// Relay connection over a WebSocket. Inbound frames are posted to the
/// session's event channel in the order the relay sent them.
pub struct WsSignalingChannel {
    tx: mpsc::UnboundedSender<Message>,
    closing: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WsSignalingChannel {
    pub async fn connect(url: &str, events: EventSender) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("{}: {}", url, e)))?;
        info!("Connected to relay at {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let closing = Arc::new(AtomicBool::new(false));

        // Handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Failed to write to relay: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Handle incoming messages
        let reader_closing = closing.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayMessage>(&text) {
                            Ok(message) => {
                                if let Some(event) = message.into_event() {
                                    if events.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!("Dropping unparseable relay frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                }
            };

            if reader_closing.load(Ordering::SeqCst) {
                debug!("Relay connection closed after local disconnect");
            } else {
                warn!("Relay connection lost: {}", reason);
                let _ = events.send(SessionEvent::SignalingLost { reason });
            }
        });

        Ok(Self {
            tx,
            closing,
            writer: Some(writer),
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        let json = serde_json::to_string(&message)?;
        self.tx
            .send(Message::Text(json))
            .map_err(|_| Error::SignalingUnavailable("relay writer has stopped".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.send(Message::Close(None));
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!("Disconnected from relay");
        Ok(())
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
