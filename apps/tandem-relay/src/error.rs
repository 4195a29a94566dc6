use std::fmt;

use tandem_proto::{PayloadError, PeerRole};

use crate::registry::ClientId;

/// Failure reported by a media-engine session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error("invalid ICE port range {start}-{end}: {reason}")]
    PortRange { start: u16, end: u16, reason: String },
    #[error("session description type {0} is not supported here")]
    UnsupportedSdp(&'static str),
    #[error("{0}")]
    Other(String),
}

/// The media-engine call that failed during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::CreateOffer => "create_offer",
            Step::CreateAnswer => "create_answer",
            Step::SetLocalDescription => "set_local_description",
            Step::SetRemoteDescription => "set_remote_description",
            Step::AddIceCandidate => "add_ice_candidate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-client negotiation failure. None of these abort the process: the
/// router reports them to the client and releases the client's sessions.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("no duplex connection registered for client {0}")]
    ConnectionMissing(ClientId),
    #[error("failed to create {role} session: {source}")]
    SessionSetup {
        role: PeerRole,
        #[source]
        source: EngineError,
    },
    #[error("invalid {what} payload: {source}")]
    Payload {
        role: PeerRole,
        what: &'static str,
        #[source]
        source: PayloadError,
    },
    #[error("expected an {expected} description, got {actual}")]
    UnexpectedSdp {
        role: PeerRole,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{step} failed on {role} session: {source}")]
    Engine {
        role: PeerRole,
        step: Step,
        #[source]
        source: EngineError,
    },
}

impl NegotiationError {
    pub(crate) fn engine(role: PeerRole, step: Step) -> impl FnOnce(EngineError) -> Self {
        move |source| NegotiationError::Engine { role, step, source }
    }

    /// Server session the failure concerns, in wire terms.
    pub fn role(&self) -> PeerRole {
        match self {
            NegotiationError::ConnectionMissing(_) => PeerRole::Unspecified,
            NegotiationError::SessionSetup { role, .. }
            | NegotiationError::Payload { role, .. }
            | NegotiationError::UnexpectedSdp { role, .. }
            | NegotiationError::Engine { role, .. } => *role,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            NegotiationError::ConnectionMissing(_) => "connection",
            NegotiationError::SessionSetup { .. } => "session_setup",
            NegotiationError::Payload { .. } | NegotiationError::UnexpectedSdp { .. } => "payload",
            NegotiationError::Engine { step, .. } => step.as_str(),
        }
    }
}
