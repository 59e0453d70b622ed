use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A signaling envelope, exchanged encrypted over the signaler socket.
///
/// `from`/`to` are community identities. Offer and answer payloads carry the
/// JSON-serialized session description; candidate payloads carry the raw ICE
/// candidate string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Introduction {
        from: String,
    },
    Offer {
        from: String,
        to: String,
        payload: Value,
    },
    Answer {
        from: String,
        to: String,
        payload: Value,
    },
    Candidate {
        from: String,
        to: String,
        payload: String,
    },
}

impl Envelope {
    /// Identity of the sender.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Introduction { from }
            | Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::Candidate { from, .. } => from,
        }
    }

    /// Short name of the envelope type, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Introduction { .. } => "introduction",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate { .. } => "candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn introduction_wire_shape() {
        let envelope = Envelope::Introduction {
            from: "peer-a".to_string(),
        };
        let text = serde_json::to_string(&envelope).expect("encode");
        assert_eq!(text, r#"{"type":"introduction","from":"peer-a"}"#);
    }

    #[test]
    fn offer_round_trip() {
        let envelope = Envelope::Offer {
            from: "a".to_string(),
            to: "b".to_string(),
            payload: json!({"type": "offer", "sdp": "v=0"}),
        };
        let text = serde_json::to_string(&envelope).expect("encode");
        let parsed: Envelope = serde_json::from_str(&text).expect("decode");
        match parsed {
            Envelope::Offer { from, to, payload } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(payload["sdp"], "v=0");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn candidate_payload_is_a_raw_string() {
        let text = r#"{"type":"candidate","from":"a","to":"b","payload":"candidate:1 1 udp"}"#;
        let parsed: Envelope = serde_json::from_str(text).expect("decode");
        match parsed {
            Envelope::Candidate { payload, .. } => assert_eq!(payload, "candidate:1 1 udp"),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let text = r#"{"type":"presence","from":"a"}"#;
        assert!(serde_json::from_str::<Envelope>(text).is_err());
    }
}
