//! Wire format for room payloads: one JSON object per published message, no framing.

use crate::protocol::ChatMessage;

/// Largest payload accepted on either side.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024; // 64 KiB

/// Encode a chat message into a publish payload.
pub fn encode_message(msg: &ChatMessage) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(msg).map_err(WireError::Encode)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::TooLarge(payload.len()));
    }
    Ok(payload)
}

/// Decode a publish payload. Unknown or missing fields are an error, never defaulted.
pub fn decode_message(bytes: &[u8]) -> Result<ChatMessage, WireError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    serde_json::from_slice(bytes).map_err(WireError::Decode)
}

/// Error encoding or decoding a room payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("payload too large ({0} bytes)")]
    TooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn sample(text: &str) -> ChatMessage {
        ChatMessage {
            message: text.to_string(),
            sender_id: Keypair::generate().node_id(),
            sender_name: "alice".to_string(),
        }
    }

    #[test]
    fn roundtrip_message() {
        let msg = sample("hello \"world\"\n\u{1F600}");
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn field_names_on_the_wire() {
        let msg = sample("hi");
        let value: serde_json::Value = serde_json::from_slice(&encode_message(&msg).unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["message"], "hi");
        assert_eq!(obj["senderid"], msg.sender_id.to_string());
        assert_eq!(obj["sendername"], "alice");
    }

    #[test]
    fn missing_field_is_error() {
        let id = Keypair::generate().node_id();
        let raw = format!(r#"{{"message":"hi","senderid":"{}"}}"#, id);
        assert!(matches!(
            decode_message(raw.as_bytes()),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn unknown_field_is_error() {
        let id = Keypair::generate().node_id();
        let raw = format!(
            r#"{{"message":"hi","senderid":"{}","sendername":"a","extra":1}}"#,
            id
        );
        assert!(matches!(
            decode_message(raw.as_bytes()),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn malformed_payloads_are_errors() {
        for raw in [&b""[..], b"not json", b"{", b"[1,2,3]", b"\xff\xfe"] {
            assert!(decode_message(raw).is_err());
        }
        let raw = br#"{"message":"hi","senderid":"not-base58-0OIl","sendername":"a"}"#;
        assert!(matches!(decode_message(raw), Err(WireError::Decode(_))));
    }

    #[test]
    fn oversized_payload_rejected() {
        let msg = sample(&"x".repeat(MAX_PAYLOAD_LEN));
        assert!(matches!(encode_message(&msg), Err(WireError::TooLarge(_))));
        let big = vec![b' '; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(decode_message(&big), Err(WireError::TooLarge(_))));
    }
}
