//! Transport seam between the session runtime and the WebRTC stack.
//!
//! A [`PeerConnector`] builds one [`PeerTransport`] per remote peer and wires
//! every library callback into events posted to the dispatcher queue, keyed
//! by peer id. The worker never touches a raw connection handle outside the
//! session that owns it; a callback for a peer that no longer exists is a
//! no-op event.

pub mod mock;
pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ChannelLabels, IceServer};
use crate::dispatch::EventQueue;
use crate::session::SessionRole;
use crate::signal::{Candidate, PeerId};

/// High-level connection state as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportPhase {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("sdp rejected: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

/// Knobs the connector needs from the core configuration.
#[derive(Clone, Debug)]
pub struct RtcSettings {
    pub ice_servers: Vec<IceServer>,
    pub labels: ChannelLabels,
    pub channel_buffer_bytes: usize,
}

/// One peer connection. Handshake operations are async; the worker spawns
/// them and consumes completions as events.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, RtcError>;
    async fn create_answer(&self) -> Result<String, RtcError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError>;
    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), RtcError>;
    /// Idempotent async shutdown; terminal state arrives as a phase event.
    async fn close(&self);
}

/// Factory for peer transports. The offerer side pre-creates the data
/// channels before the offer so the SDP advertises them; the answerer learns
/// them from channel-open events.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerId,
        role: SessionRole,
        events: EventQueue,
    ) -> Result<Arc<dyn PeerTransport>, RtcError>;
}
