use std::sync::Arc;

use crate::engine::SessionFactory;
use crate::registry::{ClientId, ConnectionRegistry, SessionPair, SessionRegistry};

/// Process-wide signaling state shared by every connection task.
#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionRegistry,
    pub sessions: SessionRegistry,
    factory: Arc<dyn SessionFactory>,
}

impl AppState {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            sessions: SessionRegistry::new(),
            factory,
        }
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    /// Drops both registry entries; the caller owns closing the pair.
    pub fn detach_client(&self, client_id: &ClientId) -> Option<SessionPair> {
        self.connections.remove(client_id);
        self.sessions.remove(client_id)
    }
}
