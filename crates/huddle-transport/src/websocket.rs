//! WebSocket connection over axum.
//!
//! Text frames carry JSON messages. Binary frames carry length-prefixed
//! MessagePack. Outgoing messages use whichever frame kind the peer used last,
//! starting with text.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, ConnectionReader, ConnectionWriter, TransportError};

/// Default maximum incoming frame size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// An upgraded axum WebSocket.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
    max_message_size: usize,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            max_message_size,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let this = *self;
        let binary = Arc::new(AtomicBool::new(false));
        let (sink, stream) = this.socket.split();

        let reader = AxumReader {
            id: this.id.clone(),
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: this.max_message_size,
            binary: binary.clone(),
        };
        let writer = AxumWriter {
            sink,
            binary,
            is_open: true,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct AxumReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    binary: Arc<AtomicBool>,
}

impl AxumReader {
    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(
                connection = %self.id,
                size,
                max = self.max_message_size,
                "Message too large"
            );
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionReader for AxumReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        // A previous binary frame may have carried more than one message.
        if let Some(message) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(message));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    self.check_size(text.len())?;
                    self.binary.store(false, Ordering::Relaxed);
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.binary.store(true, Ordering::Relaxed);
                    self.read_buffer.extend_from_slice(&data);

                    if let Some(message) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(message));
                    }
                }
                // axum answers pings itself
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

struct AxumWriter {
    sink: SplitSink<WebSocket, WsMessage>,
    binary: Arc<AtomicBool>,
    is_open: bool,
}

#[async_trait]
impl ConnectionWriter for AxumWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = if self.binary.load(Ordering::Relaxed) {
            WsMessage::Binary(codec::encode(message)?.to_vec())
        } else {
            WsMessage::Text(codec::encode_json(message)?)
        };

        self.sink
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}
