//! CBOR encoding of envelopes and payloads.

use nodelink_types::constants::MAX_FRAME_SIZE;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::message::Envelope;

/// Encode a CBOR payload.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    ciborium::into_writer(payload, &mut buf)?;

    if buf.len() > MAX_FRAME_SIZE {
        return Err(EncodeError::PayloadTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(buf)
}

/// Decode a CBOR payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    ciborium::from_reader(bytes).map_err(|e| DecodeError::PayloadDecodeFailed(e.to_string()))
}

/// Encode an envelope.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    encode_payload(envelope)
}

/// Decode an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    decode_payload(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use nodelink_types::{NodeId, NodeIdentity};

    #[test]
    fn test_envelope_roundtrip() {
        let mut env = Envelope::new(Some(MessageType::Request), "nodelink.requests")
            .with_reply_to("nodelink.tmp.1")
            .with_property("nodelink.requestId", "r1")
            .with_body(b"hello".to_vec());
        env.metadata.insert("category".into(), "rpc".into());

        let bytes = encode_envelope(&env).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_identity_payload_roundtrip() {
        let identity = NodeIdentity::new(NodeId::new("aaa").unwrap(), "Node A").with_workflow_host(true);
        let bytes = encode_payload(&identity).unwrap();
        let decoded: NodeIdentity = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.id, identity.id);
        assert_eq!(decoded.display_name, "Node A");
        assert!(decoded.is_workflow_host);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Envelope, _> = decode_payload(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(DecodeError::PayloadDecodeFailed(_))));
    }

    #[test]
    fn test_payload_too_large() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        let result = encode_payload(&serde_bytes_like(big));
        assert!(matches!(result, Err(EncodeError::PayloadTooLarge { .. })));
    }

    // Wraps bytes so CBOR writes them as a single byte string.
    fn serde_bytes_like(bytes: Vec<u8>) -> ciborium::value::Value {
        ciborium::value::Value::Bytes(bytes)
    }
}
