use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel send failed: {0}")]
    Send(String),
}

/// One unreliable peer data channel.
pub trait DataChannel: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), ChannelError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no peer transport configured")]
    Unavailable,
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Offer/answer/ICE handling for browser peers. Terminal data channels that
/// come out of a negotiation are handed to the terminal bridge.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Returns the answer payload to relay back to the peer.
    async fn handle_offer(&self, peer_id: &str, payload: Value) -> Result<Value, TransportError>;
    async fn handle_answer(&self, peer_id: &str, payload: Value) -> Result<(), TransportError>;
    async fn handle_ice(&self, peer_id: &str, payload: Value) -> Result<(), TransportError>;
    async fn close_all(&self);
}

/// Transport used when the daemon runs without a peer stack.
#[derive(Debug, Default)]
pub struct DisabledTransport;

#[async_trait]
impl PeerTransport for DisabledTransport {
    async fn handle_offer(&self, _peer_id: &str, _payload: Value) -> Result<Value, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn handle_answer(&self, _peer_id: &str, _payload: Value) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn handle_ice(&self, _peer_id: &str, _payload: Value) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn close_all(&self) {}
}
