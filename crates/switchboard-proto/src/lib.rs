//! Wire envelopes exchanged over the signaling socket.
//! Keeping these in a dedicated crate lets the relay server and the
//! endpoint library share one definition of the protocol surface.
//!
//! Every envelope is one JSON object per WebSocket text message, with an
//! `id` field discriminating the kind. Unknown kinds deserialize to the
//! explicit `Unknown` variant so forward-compatible clients can be
//! tolerated deliberately rather than by accident.

use serde::{Deserialize, Serialize};

/// Which half of an offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque negotiated description of a proposed or accepted media
/// transport configuration. The relay never inspects the `sdp` body.
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
}

/// One discovered network path, trickled incrementally between peers.
/// Member names follow the browser `RTCIceCandidateInit` dictionary so
/// payloads interoperate with non-Rust endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

/// Outcome reported back for a registration or call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// A callee's decision on an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDecision {
    Accept,
    Reject,
}

/// Envelopes sent from an endpoint to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientEnvelope {
    /// Bind a display name to this connection.
    Register { name: String },
    /// Ask for the names of all currently registered endpoints.
    List,
    /// Place a call: pair with `to` and hand over the local offer.
    Call {
        from: String,
        to: String,
        #[serde(rename = "sdpOffer")]
        sdp_offer: SessionDescription,
    },
    /// Callee's decision on an incoming call. The answer is present when
    /// the callee produced one eagerly; a deferred callee sends it later
    /// as a separate `answer` envelope.
    IncomingCallResponse {
        from: String,
        #[serde(rename = "callResponse")]
        call_response: CallDecision,
        #[serde(
            rename = "sdpAnswer",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_answer: Option<SessionDescription>,
    },
    /// Relay a locally discovered candidate to the current peer.
    OnIceCandidate { candidate: CandidateInit },
    /// Relay a later-stage answer to the current peer.
    Answer { sdp: SessionDescription },
    /// Release the current pairing.
    Stop,
    /// Liveness probe.
    Ping,
    /// Forward-compatibility: kinds this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Envelopes sent from the relay to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerEnvelope {
    RegisterResponse {
        response: Verdict,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ListResponse {
        list: Vec<String>,
    },
    /// A caller wants to negotiate; carries the caller's offer.
    IncomingCall {
        from: String,
        offer: SessionDescription,
    },
    /// Outcome of a placed call. On acceptance the callee's answer rides
    /// along when it was produced eagerly.
    CallResponse {
        response: Verdict,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(
            rename = "sdpAnswer",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_answer: Option<SessionDescription>,
    },
    /// Transport completion: the description the receiving side still
    /// needs (the stored offer for the callee, a relayed answer for the
    /// caller).
    StartCommunication {
        sdp: SessionDescription,
    },
    /// A candidate trickled from the current peer.
    IceCandidate {
        candidate: CandidateInit,
    },
    /// The peer released the pairing.
    StopCommunication,
    Pong,
    #[serde(other)]
    Unknown,
}

impl ServerEnvelope {
    /// A `callResponse` rejection with a user-visible reason.
    pub fn call_rejected(message: impl Into<String>) -> Self {
        ServerEnvelope::CallResponse {
            response: Verdict::Rejected,
            message: Some(message.into()),
            sdp_answer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_envelope_wire_shape() {
        let json = serde_json::to_value(ClientEnvelope::Register {
            name: "alice".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"id": "register", "name": "alice"}));
    }

    #[test]
    fn call_envelope_wire_shape() {
        let json = serde_json::to_value(ClientEnvelope::Call {
            from: "alice".into(),
            to: "bob".into(),
            sdp_offer: SessionDescription::offer("v=0"),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "call",
                "from": "alice",
                "to": "bob",
                "sdpOffer": {"type": "offer", "sdp": "v=0"},
            })
        );
    }

    #[test]
    fn candidate_members_are_browser_shaped() {
        let json = serde_json::to_value(CandidateInit {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        })
        .unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn unknown_client_kind_is_tolerated() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"id": "holography", "payload": 12}"#).unwrap();
        assert_eq!(envelope, ClientEnvelope::Unknown);
    }

    #[test]
    fn unknown_server_kind_is_tolerated() {
        let envelope: ServerEnvelope = serde_json::from_str(r#"{"id": "incomingMsg"}"#).unwrap();
        assert_eq!(envelope, ServerEnvelope::Unknown);
    }

    #[test]
    fn incoming_call_response_omits_absent_answer() {
        let json = serde_json::to_string(&ClientEnvelope::IncomingCallResponse {
            from: "alice".into(),
            call_response: CallDecision::Accept,
            sdp_answer: None,
        })
        .unwrap();
        assert!(!json.contains("sdpAnswer"));
        let back: ClientEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            ClientEnvelope::IncomingCallResponse {
                call_response: CallDecision::Accept,
                sdp_answer: None,
                ..
            }
        ));
    }

    #[test]
    fn unit_kinds_round_trip() {
        for (envelope, tag) in [
            (ClientEnvelope::List, "list"),
            (ClientEnvelope::Stop, "stop"),
            (ClientEnvelope::Ping, "ping"),
        ] {
            let json = serde_json::to_value(&envelope).unwrap();
            assert_eq!(json, serde_json::json!({"id": tag}));
        }
        assert_eq!(
            serde_json::to_value(ServerEnvelope::Pong).unwrap(),
            serde_json::json!({"id": "pong"})
        );
    }
}
