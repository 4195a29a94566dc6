//! Boundary between the signaling core and the media engine.
//!
//! The core only drives sessions through [`PeerSession`] and receives the
//! engine's asynchronous callbacks as [`SessionEvent`] messages, so nothing
//! in the engine's callback domain touches shared state directly.

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use tandem_proto::{IceCandidateInit, PeerRole, SessionDescription};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::registry::ClientId;

pub use rtc::{RtcSessionFactory, RtcSettings};

#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Wire role of this session: `Sender` for upload, `Receiver` for download.
    fn role(&self) -> PeerRole;
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds fully configured sessions: transceivers attached and callbacks
/// wired into the context's event channel.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Session that answers the client's offer and accepts its media.
    async fn download_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError>;

    /// Session the server offers on, carrying placeholder outbound tracks.
    async fn upload_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError>;
}

#[derive(Clone, Debug)]
pub struct SessionContext {
    pub client_id: ClientId,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Cancelled when the client's connection goes away.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LocalCandidate {
        role: PeerRole,
        candidate: IceCandidateInit,
    },
    ConnectionStateChanged {
        role: PeerRole,
        state: ConnectionState,
    },
    IceStateChanged {
        role: PeerRole,
        state: IceState,
    },
    TrackReceived {
        role: PeerRole,
        kind: MediaKind,
        ssrc: u32,
    },
    TrackEnded {
        role: PeerRole,
        kind: MediaKind,
        packets: u64,
    },
}
