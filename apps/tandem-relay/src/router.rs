//! Per-connection signaling loop.
//!
//! Each accepted socket gets one reader (this module's read loop), one
//! writer task that owns the socket's send half, and one event pump that
//! turns engine callbacks into outbound envelopes. Everything written to the
//! client goes through the writer's channel, so frames never interleave.

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tandem_proto::{Envelope, MessageType, NegotiationFailure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::engine::{SessionContext, SessionEvent};
use crate::error::NegotiationError;
use crate::metrics;
use crate::negotiation::{self, session_label};
use crate::registry::{ClientId, ClientOutbox};
use crate::state::AppState;

/// Transport-neutral view of one inbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping/pong; the transport answers these itself.
    Control,
    Close,
}

/// Serves one client until its connection closes.
///
/// Returns once the read loop has ended and the client's registry entries
/// are gone; session teardown continues in the background.
pub async fn serve_connection<S, E, K>(state: AppState, inbound: S, outbound: K)
where
    S: Stream<Item = Result<InboundFrame, E>> + Unpin + Send,
    E: Display + Send,
    K: Sink<String> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let client_id = ClientId::new();
    let span = info_span!("client", client_id = %client_id);
    let cancel = CancellationToken::new();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(
        write_loop(client_id.clone(), rx, outbound, cancel.clone()).instrument(span.clone()),
    );
    state
        .connections
        .insert(ClientOutbox::new(client_id.clone(), tx));
    let lease = ClientLease::acquire(state.clone(), client_id.clone(), cancel.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(
        pump_events(state.clone(), client_id.clone(), events_rx, cancel.clone())
            .instrument(span.clone()),
    );

    let ctx = SessionContext {
        client_id,
        events: events_tx,
        cancel,
    };
    async {
        info!("client connected");
        read_loop(&state, &ctx, inbound).await;
        info!("client disconnected");
    }
    .instrument(span)
    .await;
    drop(lease);
}

/// Ties a client's registry entries, sessions and background tasks to the
/// lifetime of its read loop.
struct ClientLease {
    state: AppState,
    client_id: ClientId,
    cancel: CancellationToken,
}

impl ClientLease {
    fn acquire(state: AppState, client_id: ClientId, cancel: CancellationToken) -> Self {
        metrics::CLIENTS_CONNECTED.inc();
        Self {
            state,
            client_id,
            cancel,
        }
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.cancel.cancel();
        metrics::CLIENTS_CONNECTED.dec();
        let Some(pair) = self.state.detach_client(&self.client_id) else {
            return;
        };
        let client_id = self.client_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pair.close(&client_id).await;
                    debug!(client_id = %client_id, "session pair closed");
                });
            }
            Err(_) => warn!(
                client_id = %client_id,
                "no runtime available; session pair dropped without close"
            ),
        }
    }
}

async fn read_loop<S, E>(state: &AppState, ctx: &SessionContext, mut inbound: S)
where
    S: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(InboundFrame::Text(text)) => text,
            Ok(InboundFrame::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("non-UTF-8 binary frame; closing connection");
                    break;
                }
            },
            Ok(InboundFrame::Control) => continue,
            Ok(InboundFrame::Close) => {
                debug!("close frame received");
                break;
            }
            Err(err) => {
                warn!(error = %err, "websocket read failed");
                break;
            }
        };

        let envelope = match Envelope::from_text(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "undecodable envelope; closing connection");
                break;
            }
        };
        dispatch(state, ctx, envelope).await;
    }
}

async fn dispatch(state: &AppState, ctx: &SessionContext, envelope: Envelope) {
    debug!(
        kind = envelope.kind.as_str(),
        peer_type = %envelope.peer_type,
        "envelope received"
    );
    let result = match &envelope.kind {
        MessageType::Offer => negotiation::handle_offer(state, ctx, &envelope).await,
        MessageType::Answer => negotiation::handle_answer(state, &ctx.client_id, &envelope).await,
        MessageType::Candidate => {
            negotiation::handle_candidate(state, &ctx.client_id, &envelope).await
        }
        other => {
            metrics::DROPPED_MESSAGES
                .with_label_values(&["unsupported"])
                .inc();
            debug!(kind = other.as_str(), "ignoring unsupported message type");
            return;
        }
    };
    if let Err(err) = result {
        report_failure(state, &ctx.client_id, err).await;
    }
}

async fn report_failure(state: &AppState, client_id: &ClientId, err: NegotiationError) {
    warn!(
        role = %err.role(),
        stage = err.stage(),
        error = %err,
        "negotiation failed"
    );
    metrics::NEGOTIATION_FAILURES
        .with_label_values(&[err.stage()])
        .inc();

    if let Some(outbox) = state.connections.get(client_id) {
        let failure = NegotiationFailure {
            reason: err.to_string(),
            stage: err.stage().to_string(),
        };
        outbox.send(Envelope::negotiation_failed(err.role(), &failure));
    }
    if let Some(pair) = state.sessions.remove(client_id) {
        pair.close(client_id).await;
    }
}

async fn write_loop<K>(
    client_id: ClientId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut sink: K,
    cancel: CancellationToken,
) where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound envelope");
                continue;
            }
        };
        if let Err(err) = sink.send(text).await {
            debug!(error = %err, "socket rejected write; writer stopping");
            break;
        }
    }
    let _ = sink.close().await;
    debug!(client_id = %client_id, "writer finished");
}

async fn pump_events(
    state: AppState,
    client_id: ClientId,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            SessionEvent::LocalCandidate { role, candidate } => {
                let Some(outbox) = state.connections.get(&client_id) else {
                    debug!(role = %role, "connection gone; local candidate dropped");
                    continue;
                };
                if outbox.send(Envelope::candidate(role, &candidate)) {
                    metrics::LOCAL_CANDIDATES
                        .with_label_values(&[session_label(role)])
                        .inc();
                }
            }
            SessionEvent::ConnectionStateChanged { role, state: peer_state } => {
                info!(role = %role, state = peer_state.as_str(), "peer connection state changed");
                metrics::PEER_STATE_TRANSITIONS
                    .with_label_values(&[session_label(role), peer_state.as_str()])
                    .inc();
            }
            SessionEvent::IceStateChanged { role, state: ice } => {
                debug!(role = %role, state = ?ice, "ice connection state changed");
            }
            SessionEvent::TrackReceived { role, kind, ssrc } => {
                info!(role = %role, kind = kind.as_str(), ssrc, "inbound track started");
            }
            SessionEvent::TrackEnded {
                role,
                kind,
                packets,
            } => {
                info!(role = %role, kind = kind.as_str(), packets, "inbound track ended");
            }
        }
    }
    debug!(client_id = %client_id, "event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;

    use crate::engine::{PeerSession, SessionFactory};
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoEngine;

    #[async_trait]
    impl SessionFactory for NoEngine {
        async fn download_session(
            &self,
            _ctx: &SessionContext,
        ) -> Result<Arc<dyn PeerSession>, EngineError> {
            Err(EngineError::Other("engine disabled".into()))
        }

        async fn upload_session(
            &self,
            _ctx: &SessionContext,
        ) -> Result<Arc<dyn PeerSession>, EngineError> {
            Err(EngineError::Other("engine disabled".into()))
        }
    }

    fn frames(
        items: Vec<InboundFrame>,
    ) -> impl Stream<Item = Result<InboundFrame, Infallible>> + Unpin + Send {
        futures::stream::iter(items.into_iter().map(Ok))
    }

    #[test_timeout::tokio_timeout_test]
    async fn setup_failure_is_reported_and_connection_released() {
        let state = AppState::new(Arc::new(NoEngine));
        let (out_tx, mut out_rx) = fmpsc::unbounded::<String>();
        let offer = r#"{"peerType":"","type":"offer","data":"{\"type\":\"offer\",\"sdp\":\"v=0\"}"}"#;

        // Keep the stream open after the offer so the failure reply is flushed
        // before the lease cancels the writer.
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<InboundFrame, Infallible>>();
        in_tx
            .unbounded_send(Ok(InboundFrame::Text(offer.into())))
            .expect("queue offer");
        let server = tokio::spawn(serve_connection(state.clone(), in_rx, out_tx));

        let reply = out_rx.next().await.expect("failure frame");
        let envelope = Envelope::from_text(&reply).expect("envelope");
        assert_eq!(envelope.kind, MessageType::NegotiationFailed);
        assert_eq!(envelope.data["stage"], "session_setup");
        assert!(state.sessions.is_empty());

        drop(in_tx);
        server.await.expect("router task");
        assert!(state.connections.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_envelope_ends_the_loop() {
        let state = AppState::new(Arc::new(NoEngine));
        let (out_tx, _out_rx) = fmpsc::unbounded::<String>();
        let inbound = frames(vec![
            InboundFrame::Control,
            InboundFrame::Text("{not json".into()),
            InboundFrame::Text(r#"{"type":"offer"}"#.into()),
        ]);
        serve_connection(state.clone(), inbound, out_tx).await;
        assert!(state.connections.is_empty());
        assert!(state.sessions.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn binary_json_is_accepted_and_unknown_types_ignored() {
        let state = AppState::new(Arc::new(NoEngine));
        let (out_tx, mut out_rx) = fmpsc::unbounded::<String>();
        let inbound = frames(vec![
            InboundFrame::Binary(br#"{"peerType":"sender","type":"renegotiate"}"#.to_vec()),
            InboundFrame::Binary(br#"{"peerType":"sender","type":"answer","data":"{}"}"#.to_vec()),
            InboundFrame::Close,
        ]);
        serve_connection(state.clone(), inbound, out_tx).await;
        // Neither message produces a reply: one is unknown, the other has no pair.
        assert!(out_rx.next().await.is_none());
    }
}
