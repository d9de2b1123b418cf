//! Wire encoding for gossip messages
//!
//! Every message is a one-byte version tag followed by the postcard encoding
//! of [`GossipMessage`]. Field order is Rust struct field order.

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Serialize a value to postcard bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Encode a message for the wire.
pub fn encode(message: &GossipMessage) -> Result<Vec<u8>> {
    let body = canonical_bytes(message)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(WIRE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a message from the wire, rejecting unknown versions and trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<GossipMessage> {
    let (&version, body) = bytes.split_first().ok_or(Error::Empty)?;
    if version != WIRE_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let (message, rest) = postcard::take_from_bytes::<GossipMessage>(body)?;
    if !rest.is_empty() {
        return Err(Error::TrailingBytes(rest.len()));
    }
    if let GossipMessage::PullRequest(req) = &message {
        validate_range(req)?;
    }
    Ok(message)
}

/// Check that a pull request range is not inverted.
pub fn validate_range(req: &PullRequest) -> Result<()> {
    if req.from_seq > req.to_seq {
        return Err(Error::InvalidRange {
            from_seq: req.from_seq,
            to_seq: req.to_seq,
        });
    }
    Ok(())
}

/// Check that payloads are strictly ascending by sequence number.
pub fn validate_ascending(payloads: &[Payload]) -> bool {
    payloads.windows(2).all(|w| w[0].seq_num < w[1].seq_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_deterministic() {
        let msg = GossipMessage::Payload {
            channel: ChannelId::from("testchainid"),
            payload: Payload::new(100, vec![9; 16]),
        };
        assert_eq!(encode(&msg).unwrap(), encode(&msg).unwrap());
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let msg = GossipMessage::PullResponse(PullResponse {
            channel: ChannelId::from("c"),
            payloads: vec![],
        });
        let mut bytes = encode(&msg).unwrap();
        bytes[0] = 2;
        assert!(matches!(decode(&bytes), Err(Error::UnsupportedVersion(2))));
        assert!(matches!(decode(&[]), Err(Error::Empty)));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let msg = GossipMessage::PullRequest(PullRequest {
            channel: ChannelId::from("c"),
            from_seq: 1,
            to_seq: 2,
        });
        let mut bytes = encode(&msg).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(Error::TrailingBytes(1))));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let msg = GossipMessage::PullRequest(PullRequest {
            channel: ChannelId::from("c"),
            from_seq: 9,
            to_seq: 3,
        });
        let bytes = encode(&msg).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(Error::InvalidRange { from_seq: 9, to_seq: 3 })
        ));
    }

    #[test]
    fn test_ascending_check() {
        let ordered = vec![Payload::new(1, vec![]), Payload::new(2, vec![])];
        let unordered = vec![Payload::new(2, vec![]), Payload::new(1, vec![])];
        assert!(validate_ascending(&ordered));
        assert!(!validate_ascending(&unordered));
        assert!(validate_ascending(&[]));
    }
}
