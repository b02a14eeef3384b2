//! Purchase Channel
//!
//! Bidirectional, ordered message channel between buyer and seller, opened
//! for one order. The WebSocket transport runs a reader task that forwards
//! parsed frames into a queue and flips a closed flag when the socket ends,
//! and a writer task that drains outgoing frames. The in-memory transport
//! has the same shape and backs the integration tests.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::market::OrderId;

/// Inbound frames buffered ahead of the session.
const INBOUND_QUEUE: usize = 64;

/// Outbound frames buffered ahead of the socket.
const OUTBOUND_QUEUE: usize = 64;

/// How long `close` waits for the close frame to reach the socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Close code for a normal end of session.
pub const CLOSE_NORMAL: u16 = 1000;

// =============================================================================
// TYPES
// =============================================================================

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Could not open the channel.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Channel is closed.
    #[error("channel closed")]
    Closed,
    /// Outgoing message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// One frame from the seller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Well-formed message.
    Message(ServerMessage),
    /// Frame that is not a known message.
    Malformed(String),
}

/// One frame from the buyer, as seen by an in-memory peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Protocol message.
    Message(ClientMessage),
    /// Channel closed by the buyer.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Classify a text frame.
pub fn parse_frame(text: &str) -> Inbound {
    match ServerMessage::from_json(text) {
        Ok(message) => Inbound::Message(message),
        Err(e) => Inbound::Malformed(e.to_string()),
    }
}

/// Channel bound to one order.
pub trait Channel: Send {
    /// Order this channel was opened for.
    fn order_id(&self) -> &OrderId;

    /// Queue a message for the seller.
    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<(), ChannelError>>;

    /// Next frame, or `None` once the channel is closed and drained.
    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>>;

    /// Flag that turns `true` when the seller side goes away.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close with a code and reason. Idempotent.
    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, ()>;
}

/// Resolve once `flag` is `true` or its sender is gone.
pub async fn wait_closed(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}

// =============================================================================
// WEBSOCKET TRANSPORT
// =============================================================================

/// WebSocket channel at `{ws_base}/ws/api/purchase/{orderId}`.
pub struct WsChannel {
    order_id: OrderId,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Inbound>,
    closed: watch::Receiver<bool>,
    closing: bool,
    writer: Option<JoinHandle<()>>,
}

impl WsChannel {
    /// Open the channel and start its reader and writer tasks.
    #[instrument(skip(ws_base))]
    pub async fn connect(ws_base: &str, order_id: OrderId) -> Result<Self, ChannelError> {
        let url = format!("{}/ws/api/purchase/{}", ws_base.trim_end_matches('/'), order_id);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!(order = %order_id, "Purchase channel open");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);

        // Writer
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let last = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!("Socket write failed: {}", e);
                    break;
                }
                if last {
                    break;
                }
            }
        });

        // Reader
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let inbound = match frame {
                    Ok(Message::Text(text)) => parse_frame(&text),
                    Ok(Message::Binary(_)) => Inbound::Malformed("binary frame".to_string()),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Seller closed channel");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Socket read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(inbound).await.is_err() {
                    break;
                }
            }
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            order_id,
            outbound: out_tx,
            inbound: in_rx,
            closed: closed_rx,
            closing: false,
            writer: Some(writer),
        })
    }
}

impl Channel for WsChannel {
    fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let text = message.to_json().map_err(|e| ChannelError::Encode(e.to_string()))?;
            debug!(kind = message.kind(), "Sending");
            self.outbound
                .send(Message::Text(text))
                .await
                .map_err(|_| ChannelError::Closed)
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>> {
        Box::pin(self.inbound.recv())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if std::mem::replace(&mut self.closing, true) {
                return;
            }
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            let _ = self.outbound.send(Message::Close(Some(frame))).await;

            // Everything queued before the close frame is written with it.
            if let Some(writer) = self.writer.take() {
                if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                    warn!(code, "Close frame not flushed before timeout");
                }
            }
        })
    }
}

// =============================================================================
// IN-MEMORY TRANSPORT
// =============================================================================

/// Buyer end of an in-process channel.
pub struct MemoryChannel {
    order_id: OrderId,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Receiver<bool>,
    closing: bool,
}

/// Seller end of an in-process channel.
pub struct MemoryPeer {
    to_buyer: mpsc::Sender<Inbound>,
    from_buyer: mpsc::UnboundedReceiver<Outbound>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    /// Connected buyer and seller ends for `order_id`.
    pub fn pair(order_id: OrderId) -> (MemoryChannel, MemoryPeer) {
        let (to_buyer, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (outbound, from_buyer) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            MemoryChannel {
                order_id,
                inbound,
                outbound,
                closed: closed_rx,
                closing: false,
            },
            MemoryPeer {
                to_buyer,
                from_buyer,
                closed: closed_tx,
            },
        )
    }
}

impl Channel for MemoryChannel {
    fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<(), ChannelError>> {
        let result = self
            .outbound
            .send(Outbound::Message(message))
            .map_err(|_| ChannelError::Closed);
        Box::pin(async move { result })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>> {
        Box::pin(self.inbound.recv())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, ()> {
        if !std::mem::replace(&mut self.closing, true) {
            let _ = self.outbound.send(Outbound::Close { code, reason });
        }
        Box::pin(async {})
    }
}

impl MemoryPeer {
    /// Deliver a message to the buyer.
    pub async fn send(&self, message: ServerMessage) -> Result<(), ChannelError> {
        self.to_buyer
            .send(Inbound::Message(message))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Deliver a raw text frame, parsed the way the socket reader does.
    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.to_buyer
            .send(parse_frame(text))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Next frame from the buyer.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_buyer.recv().await
    }

    /// Drop the connection from the seller side.
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}
