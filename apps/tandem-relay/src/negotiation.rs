//! Offer, answer and candidate handling for one client's session pair.
//!
//! Handlers run inline on the client's read loop, so calls for a single
//! client never overlap; they only race with other clients and with the
//! engine's own callbacks, which reach the socket through the event pump.

use tandem_proto::{Envelope, IceCandidateInit, PeerRole, SdpKind, SessionDescription};
use tracing::{debug, info};

use crate::engine::SessionContext;
use crate::error::{NegotiationError, Step};
use crate::metrics;
use crate::registry::{ClientId, ClientOutbox, SessionPair};
use crate::state::AppState;

/// Server session a client candidate belongs to.
///
/// The client tags candidates with the name of its own peer connection, so
/// a `receiver` candidate feeds the server's upload session (wire role
/// `sender`) and a `sender` candidate feeds the download session.
pub fn candidate_target(tag: PeerRole) -> Option<PeerRole> {
    match tag {
        PeerRole::Receiver => Some(PeerRole::Sender),
        PeerRole::Sender => Some(PeerRole::Receiver),
        PeerRole::Unspecified => None,
    }
}

/// Metric label for a server session.
pub fn session_label(role: PeerRole) -> &'static str {
    match role {
        PeerRole::Sender => "upload",
        PeerRole::Receiver => "download",
        PeerRole::Unspecified => "unknown",
    }
}

pub async fn handle_offer(
    state: &AppState,
    ctx: &SessionContext,
    envelope: &Envelope,
) -> Result<(), NegotiationError> {
    let client_id = &ctx.client_id;
    let outbox = state
        .connections
        .get(client_id)
        .ok_or_else(|| NegotiationError::ConnectionMissing(client_id.clone()))?;

    let remote: SessionDescription =
        envelope
            .payload()
            .map_err(|source| NegotiationError::Payload {
                role: PeerRole::Receiver,
                what: "offer",
                source,
            })?;
    if remote.kind != SdpKind::Offer {
        return Err(NegotiationError::UnexpectedSdp {
            role: PeerRole::Receiver,
            expected: "offer",
            actual: remote.kind.as_str(),
        });
    }

    let download = state
        .factory()
        .download_session(ctx)
        .await
        .map_err(|source| NegotiationError::SessionSetup {
            role: PeerRole::Receiver,
            source,
        })?;
    let upload = match state.factory().upload_session(ctx).await {
        Ok(upload) => upload,
        Err(source) => {
            if let Err(err) = download.close().await {
                debug!(client_id = %client_id, error = %err, "close download after setup failure");
            }
            return Err(NegotiationError::SessionSetup {
                role: PeerRole::Sender,
                source,
            });
        }
    };
    let pair = SessionPair { upload, download };

    if let Err(err) = exchange(&pair, &outbox, remote).await {
        metrics::NEGOTIATIONS.with_label_values(&["failed"]).inc();
        pair.close(client_id).await;
        return Err(err);
    }

    if let Some(previous) = state.sessions.insert(client_id.clone(), pair) {
        info!(client_id = %client_id, "re-offer replaced existing sessions");
        previous.close(client_id).await;
    }
    metrics::NEGOTIATIONS.with_label_values(&["completed"]).inc();
    info!(client_id = %client_id, "session pair negotiated");
    Ok(())
}

// Each description is queued before it is applied locally: candidate
// gathering starts at set_local_description, so its candidates always land
// behind the description on the client's writer. The upload offer is
// therefore already on the wire when its set_local_description fails; the
// client sees the offer followed by a `sender` negotiationFailed and must
// discard it.
async fn exchange(
    pair: &SessionPair,
    outbox: &ClientOutbox,
    remote: SessionDescription,
) -> Result<(), NegotiationError> {
    let offer = pair
        .upload
        .create_offer()
        .await
        .map_err(NegotiationError::engine(PeerRole::Sender, Step::CreateOffer))?;
    outbox.send(Envelope::offer(PeerRole::Sender, &offer));
    pair.upload
        .set_local_description(offer)
        .await
        .map_err(NegotiationError::engine(
            PeerRole::Sender,
            Step::SetLocalDescription,
        ))?;

    pair.download
        .set_remote_description(remote)
        .await
        .map_err(NegotiationError::engine(
            PeerRole::Receiver,
            Step::SetRemoteDescription,
        ))?;
    let answer = pair
        .download
        .create_answer()
        .await
        .map_err(NegotiationError::engine(PeerRole::Receiver, Step::CreateAnswer))?;
    outbox.send(Envelope::answer(PeerRole::Receiver, &answer));
    pair.download
        .set_local_description(answer)
        .await
        .map_err(NegotiationError::engine(
            PeerRole::Receiver,
            Step::SetLocalDescription,
        ))?;
    Ok(())
}

pub async fn handle_answer(
    state: &AppState,
    client_id: &ClientId,
    envelope: &Envelope,
) -> Result<(), NegotiationError> {
    let Some(pair) = state.sessions.get(client_id) else {
        metrics::DROPPED_MESSAGES.with_label_values(&["answer"]).inc();
        debug!(client_id = %client_id, "answer before any session pair; dropped");
        return Ok(());
    };

    let description: SessionDescription =
        envelope
            .payload()
            .map_err(|source| NegotiationError::Payload {
                role: PeerRole::Sender,
                what: "answer",
                source,
            })?;
    if !matches!(description.kind, SdpKind::Answer | SdpKind::Pranswer) {
        return Err(NegotiationError::UnexpectedSdp {
            role: PeerRole::Sender,
            expected: "answer",
            actual: description.kind.as_str(),
        });
    }

    pair.upload
        .set_remote_description(description)
        .await
        .map_err(NegotiationError::engine(
            PeerRole::Sender,
            Step::SetRemoteDescription,
        ))?;
    debug!(client_id = %client_id, "upload session answered");
    Ok(())
}

pub async fn handle_candidate(
    state: &AppState,
    client_id: &ClientId,
    envelope: &Envelope,
) -> Result<(), NegotiationError> {
    let Some(target) = candidate_target(envelope.peer_type) else {
        metrics::DROPPED_MESSAGES
            .with_label_values(&["candidate"])
            .inc();
        debug!(client_id = %client_id, "candidate without peer role; dropped");
        return Ok(());
    };
    let Some(session) = state
        .sessions
        .get(client_id)
        .and_then(|pair| pair.session(target).cloned())
    else {
        metrics::DROPPED_MESSAGES
            .with_label_values(&["candidate"])
            .inc();
        debug!(client_id = %client_id, "candidate before any session pair; dropped");
        return Ok(());
    };

    let candidate: IceCandidateInit =
        envelope
            .payload()
            .map_err(|source| NegotiationError::Payload {
                role: target,
                what: "candidate",
                source,
            })?;
    session
        .add_ice_candidate(candidate)
        .await
        .map_err(NegotiationError::engine(target, Step::AddIceCandidate))?;
    metrics::REMOTE_CANDIDATES
        .with_label_values(&[session_label(target)])
        .inc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_cross_to_the_opposite_session() {
        assert_eq!(candidate_target(PeerRole::Receiver), Some(PeerRole::Sender));
        assert_eq!(candidate_target(PeerRole::Sender), Some(PeerRole::Receiver));
        assert_eq!(candidate_target(PeerRole::Unspecified), None);
    }

    #[test]
    fn session_labels() {
        assert_eq!(session_label(PeerRole::Sender), "upload");
        assert_eq!(session_label(PeerRole::Receiver), "download");
    }
}
