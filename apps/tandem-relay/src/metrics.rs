use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CLIENTS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "signaling_clients_connected",
        "WebSocket clients currently attached",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static NEGOTIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("negotiations_total", "Offer negotiations by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static NEGOTIATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "negotiation_failures_total",
            "Negotiation failures reported to clients, by stage",
        ),
        &["stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REMOTE_CANDIDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "remote_candidates_applied_total",
            "Client ICE candidates applied, by the server session that received them",
        ),
        &["session"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LOCAL_CANDIDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "local_candidates_sent_total",
            "Server ICE candidates forwarded to clients",
        ),
        &["session"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DROPPED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "signaling_messages_dropped_total",
            "Inbound envelopes ignored: unsupported type, candidate without a peer role, or no session pair yet",
        ),
        &["type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PEER_STATE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "peer_state_transitions_total",
            "Peer connection state changes observed on server sessions",
        ),
        &["session", "state"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INBOUND_PACKETS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "inbound_media_packets_total",
            "RTP packets drained from client uploads",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_messages_are_exported_by_reason() {
        for reason in ["answer", "candidate", "unsupported"] {
            DROPPED_MESSAGES.with_label_values(&[reason]).inc();
        }
        let text = export_prometheus();
        assert!(text.contains(
            "# HELP signaling_messages_dropped_total Inbound envelopes ignored: unsupported type"
        ));
        for reason in ["answer", "candidate", "unsupported"] {
            assert!(
                text.contains(&format!("signaling_messages_dropped_total{{type=\"{reason}\"}}")),
                "{text}"
            );
        }
    }
}
