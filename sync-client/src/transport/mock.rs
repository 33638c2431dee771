//! In-memory transport for tests.
//!
//! Records every frame the client writes and hands back frames pushed by the
//! test. Installing a [`Responder`] turns it into a small scripted server:
//! each written frame goes to the responder and its replies are queued for
//! `recv()`. Faults (refused connect, stalled connect, failed write or read,
//! remote close) are armed one at a time and fire once.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Produces server frames in reply to one client frame.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
enum Link {
    #[default]
    Down,
    Up {
        address: String,
    },
    /// Server hung up; queued frames drain before the stream ends.
    Closing {
        address: String,
    },
}

#[derive(Default)]
struct Faults {
    refuse_connect: Option<String>,
    stall_connect: bool,
    fail_send: Option<String>,
    fail_recv: Option<String>,
}

#[derive(Default)]
struct Wire {
    link: Link,
    last_address: Option<String>,
    connects: u32,
    outbound: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    faults: Faults,
    responder: Option<Responder>,
}

/// Clonable in-memory transport; clones share one wire.
#[derive(Clone, Default)]
pub struct MockTransport {
    wire: Arc<Mutex<Wire>>,
    wake: Arc<Notify>,
}

impl MockTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.wake.notify_one();
    }

    /// Deliver a server frame to the next `recv()`.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.wire().inbound.push_back(frame);
        self.touch();
    }

    /// Answer every written frame with `responder`.
    pub fn set_responder(&self, responder: Responder) {
        self.wire().responder = Some(responder);
    }

    /// Every frame written so far, oldest first.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.wire().outbound.clone()
    }

    /// The most recently written frame.
    pub fn last_sent_frame(&self) -> Option<Vec<u8>> {
        self.wire().outbound.last().cloned()
    }

    /// Address of the latest successful connect.
    pub fn connected_address(&self) -> Option<String> {
        self.wire().last_address.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        self.wire().connects
    }

    /// Refuse the next connect with `error`.
    pub fn fail_next_connect(&self, error: &str) {
        self.wire().faults.refuse_connect = Some(error.to_string());
    }

    /// Never complete the next connect.
    pub fn stall_next_connect(&self) {
        self.wire().faults.stall_connect = true;
    }

    /// Fail the next write with `error`.
    pub fn fail_next_send(&self, error: &str) {
        self.wire().faults.fail_send = Some(error.to_string());
    }

    /// Fail the next read with `error`.
    pub fn fail_next_recv(&self, error: &str) {
        self.wire().faults.fail_recv = Some(error.to_string());
        self.touch();
    }

    /// The server hangs up. Frames already queued are delivered first.
    pub fn close_remote(&self) {
        let mut wire = self.wire();
        if let Link::Up { address } = std::mem::take(&mut wire.link) {
            wire.link = Link::Closing { address };
        }
        drop(wire);
        self.touch();
    }

    /// Forget everything: link, frames, faults, and responder.
    pub fn reset(&self) {
        *self.wire() = Wire::default();
        self.touch();
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wire = self.wire();
        f.debug_struct("MockTransport")
            .field("link", &wire.link)
            .field("sent", &wire.outbound.len())
            .field("queued", &wire.inbound.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let stall = {
            let mut wire = self.wire();
            if let Some(error) = wire.faults.refuse_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }
            std::mem::take(&mut wire.faults.stall_connect)
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut wire = self.wire();
        wire.link = Link::Up {
            address: address.to_string(),
        };
        wire.last_address = Some(address.to_string());
        wire.connects += 1;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let responder = {
            let mut wire = self.wire();
            if !matches!(wire.link, Link::Up { .. }) {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = wire.faults.fail_send.take() {
                return Err(TransportError::SendFailed(error));
            }
            wire.outbound.push(data.to_vec());
            wire.responder.clone()
        };

        let replies = responder.map(|answer| answer(data)).unwrap_or_default();
        if !replies.is_empty() {
            self.wire().inbound.extend(replies);
            self.touch();
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut wire = self.wire();
                if wire.link == Link::Down {
                    return Err(TransportError::NotConnected);
                }
                if let Some(error) = wire.faults.fail_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }
                if let Some(frame) = wire.inbound.pop_front() {
                    return Ok(frame);
                }
                if matches!(wire.link, Link::Closing { .. }) {
                    wire.link = Link::Down;
                    return Err(TransportError::ConnectionClosed);
                }
            }
            self.wake.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.wire().link, Link::Up { .. })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.wire().link = Link::Down;
        self.touch();
        Ok(())
    }
}
