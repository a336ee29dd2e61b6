use std::fmt;

use async_trait::async_trait;
use shared_types::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client connection that receives progress events. Sends may fail once
/// the peer is gone.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn is_open(&self) -> bool;

    async fn send(&self, event: ServerEvent) -> Result<(), ConnectionError>;
}

/// Connection backed by an in-process channel; the transport side drains
/// the receiver and writes frames to the socket.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelConnection {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                id: ConnectionId::new(),
                tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, event: ServerEvent) -> Result<(), ConnectionError> {
        self.tx.send(event).map_err(|_| ConnectionError::Closed)
    }
}

/// Best-effort delivery: skipped when the peer is gone, failures logged.
pub async fn deliver(connection: &dyn Connection, event: ServerEvent) -> bool {
    if !connection.is_open() {
        debug!(connection = %connection.id(), event = event.event_type(), "connection closed; event dropped");
        return false;
    }
    let event_type = event.event_type();
    match connection.send(event).await {
        Ok(()) => true,
        Err(e) => {
            warn!(connection = %connection.id(), event = event_type, error = %e, "event delivery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_stops_once_receiver_is_dropped() {
        let (conn, mut rx) = ChannelConnection::new();
        assert!(deliver(conn.as_ref(), ServerEvent::VncUrlUnset).await);
        assert_eq!(rx.recv().await, Some(ServerEvent::VncUrlUnset));

        drop(rx);
        assert!(!conn.is_open());
        assert!(!deliver(conn.as_ref(), ServerEvent::VncUrlUnset).await);
    }
}
