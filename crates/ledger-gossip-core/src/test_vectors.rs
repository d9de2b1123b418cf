//! Wire test vectors for cross-implementation validation
//!
//! These vectors MUST be reproduced exactly by any other implementation of
//! the wire format.

use crate::types::*;
use crate::wire::encode;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub wire_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![pull_request_vector(), payload_vector()]
}

fn pull_request_vector() -> TestVector {
    let msg = GossipMessage::PullRequest(PullRequest {
        channel: ChannelId::from("c"),
        from_seq: 1,
        to_seq: 2,
    });

    TestVector {
        name: "pull_request".into(),
        description: "version || variant(1) || len(channel) || channel || varint(from) || varint(to)"
            .into(),
        inputs: serde_json::json!({ "channel": "c", "from_seq": 1, "to_seq": 2 }),
        wire_hex: hex::encode(encode(&msg).unwrap()),
    }
}

fn payload_vector() -> TestVector {
    let msg = GossipMessage::Payload {
        channel: ChannelId::from("c"),
        payload: Payload::new(300, vec![0xaa]),
    };

    TestVector {
        name: "payload".into(),
        description: "version || variant(0) || channel || varint(seq_num) || len(data) || data"
            .into(),
        inputs: serde_json::json!({ "channel": "c", "seq_num": 300, "data": "aa" }),
        wire_hex: hex::encode(encode(&msg).unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_request_vector() {
        let v = pull_request_vector();
        assert_eq!(v.wire_hex, "010101630102");
    }

    #[test]
    fn test_payload_vector() {
        // 300 = 0xac 0x02 as a LEB128 varint
        let v = payload_vector();
        assert_eq!(v.wire_hex, "01000163ac0201aa");
    }

    #[test]
    fn test_vectors_serialize_to_json() {
        let json = serde_json::to_string_pretty(&generate_test_vectors()).unwrap();
        assert!(json.contains("pull_request"));
        assert!(json.contains("payload"));
    }
}
