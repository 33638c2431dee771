//! WebSocket transport.
//!
//! One realtime connection per `connect()`. Only binary frames carry
//! protocol messages; text frames are dropped and control frames are
//! handled by tungstenite itself.

use super::{Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Default)]
pub struct WebSocketTransport {
    sink: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
    closing: Notify,
}

impl WebSocketTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // A pending recv() holds the stream lock; wake it first.
        self.closing.notify_waiters();
        self.stream.lock().await.take();
        // The close handshake needs a live peer; give up on a dead one.
        let close = async {
            if let Some(mut sink) = self.sink.lock().await.take() {
                let _ = sink.close().await;
            }
        };
        if tokio::time::timeout(SINK_CLOSE_TIMEOUT, close).await.is_err() {
            tracing::debug!("WebSocket close handshake abandoned");
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        // Replace any previous connection.
        self.drop_connection().await;

        let (ws, _response) = connect_async(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("WebSocket connected to {}", address);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(WsMessage::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        let mut guard = self.stream.lock().await;
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = closing.as_mut() => return Err(TransportError::ConnectionClosed),
            };
            match next {
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::warn!("Dropping text frame ({} bytes)", text.len());
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!("WebSocket closed by server: {:?}", frame);
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ConnectionClosed);
                }
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.drop_connection().await;
        Ok(())
    }
}
