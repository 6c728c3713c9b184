use serde::{Deserialize, Serialize};

use crate::models::MediaKind;

/// Every control-plane message the relay carries, decoded once at the
/// transport boundary. The state machine matches on this exhaustively;
/// frames with an unrecognized `type` fail to decode and are dropped by
/// the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    CallInitiate {
        caller_name: String,
        timestamp: i64,
    },
    IncomingCall {
        caller_name: String,
        caller_id: String,
    },
    CallAccept {
        timestamp: i64,
    },
    CallAccepted {
        timestamp: i64,
    },
    CallReject {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CallRejected {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SdpOffer {
        target_user: String,
        sdp: String,
    },
    SdpAnswer {
        target_user: String,
        sdp: String,
    },
    IceCandidate {
        target_user: String,
        candidate: String,
    },
    MediaState {
        media_type: MediaKind,
        enabled: bool,
    },
    MediaStateChanged {
        user_id: String,
        media_type: MediaKind,
        enabled: bool,
    },
    ScreenShare {
        sharing: bool,
    },
    ScreenShareChanged {
        user_id: String,
        sharing: bool,
    },
    ChatMessage {
        content: String,
        timestamp: i64,
    },
    CallEnd,
    CallEnded,
    UserJoined {
        user_id: String,
    },
    UserLeft {
        user_id: String,
    },
}

impl SignalMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_initiate_wire_shape() {
        let msg = SignalMessage::CallInitiate {
            caller_name: "Alice".into(),
            timestamp: 1700000000000,
        };
        let json: serde_json::Value =
            serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "call_initiate");
        assert_eq!(json["caller_name"], "Alice");
        assert_eq!(json["timestamp"], 1700000000000i64);
    }

    #[test]
    fn incoming_call_decodes() {
        let msg = SignalMessage::decode(
            r#"{"type":"incoming_call","caller_name":"Alice","caller_id":"u1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalMessage::IncomingCall {
                caller_name: "Alice".into(),
                caller_id: "u1".into(),
            }
        );
    }

    #[test]
    fn media_state_uses_lowercase_kind() {
        let msg = SignalMessage::MediaState {
            media_type: MediaKind::Video,
            enabled: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "media_state");
        assert_eq!(json["media_type"], "video");
        assert_eq!(json["enabled"], false);
    }

    #[test]
    fn reject_reason_is_optional_on_the_wire() {
        let msg = SignalMessage::decode(r#"{"type":"call_reject","timestamp":1}"#).unwrap();
        assert_eq!(msg, SignalMessage::CallReject { timestamp: 1, reason: None });

        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn bare_lifecycle_messages() {
        assert_eq!(
            SignalMessage::decode(r#"{"type":"call_ended"}"#).unwrap(),
            SignalMessage::CallEnded
        );
        let json: serde_json::Value =
            serde_json::from_str(&SignalMessage::CallEnd.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "call_end");
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(SignalMessage::decode(r#"{"type":"hologram_mode","on":true}"#).is_err());
    }

    #[test]
    fn every_inbound_type_round_trips() {
        let samples = [
            r#"{"type":"call_accepted","timestamp":5}"#,
            r#"{"type":"call_rejected","timestamp":5,"reason":"busy"}"#,
            r#"{"type":"sdp_offer","target_user":"u2","sdp":"v=0"}"#,
            r#"{"type":"sdp_answer","target_user":"u1","sdp":"v=0"}"#,
            r#"{"type":"ice_candidate","target_user":"u1","candidate":"{}"}"#,
            r#"{"type":"media_state_changed","user_id":"u2","media_type":"audio","enabled":true}"#,
            r#"{"type":"screen_share_changed","user_id":"u2","sharing":true}"#,
            r#"{"type":"chat_message","content":"hi","timestamp":9}"#,
            r#"{"type":"user_joined","user_id":"u2"}"#,
            r#"{"type":"user_left","user_id":"u2"}"#,
        ];
        for raw in samples {
            let msg = SignalMessage::decode(raw).unwrap();
            let back = SignalMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(msg, back, "round trip failed for {raw}");
        }
    }
}
