//! Wire protocol spoken over the signaling WebSocket.
//!
//! Every frame carries exactly one [`Envelope`]. Browsers double-encode the
//! `data` field (it arrives as a JSON string holding JSON), while the relay
//! always answers with plain objects, so decoding goes through
//! [`Envelope::payload`] which accepts both shapes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which of the client's two peer sessions an envelope refers to.
///
/// `Sender` is the session the client uploads on (the relay's download
/// session); `Receiver` is the one the relay delivers media on. Missing,
/// empty or unrecognised values collapse to `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum PeerRole {
    Sender,
    Receiver,
    #[default]
    Unspecified,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Sender => "sender",
            PeerRole::Receiver => "receiver",
            PeerRole::Unspecified => "",
        }
    }
}

impl From<Option<String>> for PeerRole {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            Some(role) if role.eq_ignore_ascii_case("sender") => PeerRole::Sender,
            Some(role) if role.eq_ignore_ascii_case("receiver") => PeerRole::Receiver,
            _ => PeerRole::Unspecified,
        }
    }
}

impl From<PeerRole> for String {
    fn from(role: PeerRole) -> Self {
        role.as_str().to_string()
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Unspecified => f.write_str("unspecified"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Negotiation phase selected by the envelope's `type` field. A missing or
/// null `type` decodes to an empty `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum MessageType {
    Offer,
    Answer,
    Candidate,
    /// Relay → client only: a negotiation attempt was abandoned.
    NegotiationFailed,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Candidate => "candidate",
            MessageType::NegotiationFailed => "negotiationFailed",
            MessageType::Unknown(raw) => raw.as_str(),
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "offer" => MessageType::Offer,
            "answer" => MessageType::Answer,
            "candidate" => MessageType::Candidate,
            "negotiationFailed" => MessageType::NegotiationFailed,
            _ => MessageType::Unknown(value),
        }
    }
}

impl From<Option<String>> for MessageType {
    fn from(value: Option<String>) -> Self {
        value.map(MessageType::from).unwrap_or_default()
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unknown(String::new())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({ "type": self.kind.as_str(), "sdp": self.sdp })
    }
}

/// Mirrors the browser's `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    fn to_json(&self) -> Value {
        let mut value = json!({ "candidate": self.candidate });
        if let Some(mid) = &self.sdp_mid {
            value["sdpMid"] = json!(mid);
        }
        if let Some(index) = self.sdp_mline_index {
            value["sdpMLineIndex"] = json!(index);
        }
        if let Some(ufrag) = &self.username_fragment {
            value["usernameFragment"] = json!(ufrag);
        }
        value
    }
}

/// Body of a `negotiationFailed` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationFailure {
    pub reason: String,
    pub stage: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("envelope carries no payload")]
    Missing,
    #[error("string payload is not valid JSON for the expected type: {0}")]
    Nested(#[source] serde_json::Error),
    #[error("payload does not match the expected type: {0}")]
    Direct(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "peerType", default)]
    pub peer_type: PeerRole,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn offer(peer_type: PeerRole, description: &SessionDescription) -> Self {
        Self {
            peer_type,
            kind: MessageType::Offer,
            data: description.to_json(),
        }
    }

    pub fn answer(peer_type: PeerRole, description: &SessionDescription) -> Self {
        Self {
            peer_type,
            kind: MessageType::Answer,
            data: description.to_json(),
        }
    }

    pub fn candidate(peer_type: PeerRole, candidate: &IceCandidateInit) -> Self {
        Self {
            peer_type,
            kind: MessageType::Candidate,
            data: candidate.to_json(),
        }
    }

    pub fn negotiation_failed(peer_type: PeerRole, failure: &NegotiationFailure) -> Self {
        Self {
            peer_type,
            kind: MessageType::NegotiationFailed,
            data: json!({ "reason": failure.reason, "stage": failure.stage }),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes `data`, unwrapping one level of string encoding if present.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        match &self.data {
            Value::Null => Err(PayloadError::Missing),
            Value::String(raw) => serde_json::from_str(raw).map_err(PayloadError::Nested),
            other => T::deserialize(other).map_err(PayloadError::Direct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_browser_offer_with_nested_payload() {
        let inner = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let frame = json!({ "peerType": "sender", "type": "offer", "data": inner }).to_string();

        let envelope = Envelope::from_text(&frame).expect("envelope");
        assert_eq!(envelope.peer_type, PeerRole::Sender);
        assert_eq!(envelope.kind, MessageType::Offer);

        let description: SessionDescription = envelope.payload().expect("nested sdp");
        assert_eq!(description.kind, SdpKind::Offer);
        assert_eq!(description.sdp, "v=0\r\n");
    }

    #[test]
    fn empty_missing_or_null_role_is_unspecified() {
        for frame in [
            r#"{"peerType":"","type":"offer","data":"{}"}"#,
            r#"{"type":"offer","data":"{}"}"#,
            r#"{"peerType":null,"type":"offer","data":"{}"}"#,
            r#"{"peerType":"mixer","type":"offer","data":"{}"}"#,
        ] {
            let envelope = Envelope::from_text(frame).expect(frame);
            assert_eq!(envelope.peer_type, PeerRole::Unspecified, "{frame}");
        }
    }

    #[test]
    fn unknown_message_type_is_preserved() {
        let envelope = Envelope::from_text(r#"{"peerType":"sender","type":"renegotiate"}"#)
            .expect("envelope");
        assert_eq!(envelope.kind, MessageType::Unknown("renegotiate".into()));
        assert!(matches!(
            envelope.payload::<SessionDescription>(),
            Err(PayloadError::Missing)
        ));
    }

    #[test]
    fn missing_or_null_type_is_an_empty_unknown() {
        for frame in [
            r#"{"peerType":"sender","data":"{}"}"#,
            r#"{"peerType":"sender","type":null}"#,
        ] {
            let envelope = Envelope::from_text(frame).expect(frame);
            assert_eq!(envelope.kind, MessageType::Unknown(String::new()), "{frame}");
        }
    }

    #[test]
    fn candidate_payload_accepts_plain_object() {
        let frame = json!({
            "peerType": "receiver",
            "type": "candidate",
            "data": {
                "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 50001 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        })
        .to_string();
        let envelope = Envelope::from_text(&frame).expect("envelope");
        let candidate: IceCandidateInit = envelope.payload().expect("candidate");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn outbound_envelopes_carry_objects_not_strings() {
        let text = Envelope::answer(PeerRole::Receiver, &SessionDescription::answer("v=0"))
            .to_text()
            .expect("serialize");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["peerType"], "receiver");
        assert_eq!(value["type"], "answer");
        assert_eq!(value["data"]["type"], "answer");
        assert_eq!(value["data"]["sdp"], "v=0");
    }

    #[test]
    fn negotiation_failed_envelope_shape() {
        let failure = NegotiationFailure {
            reason: "remote description rejected".into(),
            stage: "apply_remote_offer".into(),
        };
        let value: Value = serde_json::from_str(
            &Envelope::negotiation_failed(PeerRole::Sender, &failure)
                .to_text()
                .expect("serialize"),
        )
        .expect("json");
        assert_eq!(value["type"], "negotiationFailed");
        assert_eq!(value["data"]["stage"], "apply_remote_offer");
    }

    #[test]
    fn malformed_nested_payload_is_reported() {
        let envelope = Envelope {
            peer_type: PeerRole::Sender,
            kind: MessageType::Answer,
            data: Value::String("{not json".into()),
        };
        assert!(matches!(
            envelope.payload::<SessionDescription>(),
            Err(PayloadError::Nested(_))
        ));
    }
}
