use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tandem_proto::{Envelope, PeerRole};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::PeerSession;

/// Opaque token minted once per WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Arc<str>);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write handle for one client's connection. Every envelope goes through a
/// single writer task, so each one lands on the socket as exactly one frame.
#[derive(Clone, Debug)]
pub struct ClientOutbox {
    client_id: ClientId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ClientOutbox {
    pub fn new(client_id: ClientId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { client_id, tx }
    }

    /// Best effort: a closed connection just drops the envelope.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    client_id = %self.client_id,
                    kind = err.0.kind.as_str(),
                    "connection writer gone; envelope dropped"
                );
                false
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<ClientId, ClientOutbox>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, outbox: ClientOutbox) {
        self.inner.insert(outbox.client_id.clone(), outbox);
    }

    pub fn get(&self, client_id: &ClientId) -> Option<ClientOutbox> {
        self.inner.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, client_id: &ClientId) -> Option<ClientOutbox> {
        self.inner.remove(client_id).map(|(_, outbox)| outbox)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// The two server-side sessions negotiated for one client.
#[derive(Clone)]
pub struct SessionPair {
    /// Server offers on this one ("sender" on the wire).
    pub upload: Arc<dyn PeerSession>,
    /// Answers the client's offer ("receiver" on the wire).
    pub download: Arc<dyn PeerSession>,
}

impl SessionPair {
    pub fn session(&self, role: PeerRole) -> Option<&Arc<dyn PeerSession>> {
        match role {
            PeerRole::Sender => Some(&self.upload),
            PeerRole::Receiver => Some(&self.download),
            PeerRole::Unspecified => None,
        }
    }

    pub async fn close(&self, client_id: &ClientId) {
        for session in [&self.download, &self.upload] {
            if let Err(err) = session.close().await {
                warn!(
                    client_id = %client_id,
                    role = %session.role(),
                    error = %err,
                    "failed to close peer session"
                );
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<ClientId, SessionPair>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pair this one displaced, if any.
    pub fn insert(&self, client_id: ClientId, pair: SessionPair) -> Option<SessionPair> {
        self.inner.insert(client_id, pair)
    }

    /// Clones the handles out so no map guard is held across an await.
    pub fn get(&self, client_id: &ClientId) -> Option<SessionPair> {
        self.inner.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, client_id: &ClientId) -> Option<SessionPair> {
        self.inner.remove(client_id).map(|(_, pair)| pair)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
