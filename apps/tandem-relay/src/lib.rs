//! WebRTC signaling relay.
//!
//! Every client gets two server-side peer sessions negotiated over one
//! WebSocket: an upload session the relay offers on, and a download session
//! that answers the client's offer.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod negotiation;
pub mod registry;
pub mod router;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use state::AppState;
