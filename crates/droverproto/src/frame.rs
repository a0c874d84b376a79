//! Wire framing: serialized body plus out-of-band transfer handles.
//!
//! The body is the JSON-encoded envelope. Transfer handles are zero-copy
//! references that must not be serialized, so they travel as a sidecar on
//! the frame and are re-attached on decode.

use bytes::Bytes;

use crate::{Envelope, ProtocolError, TransferHandle};

/// A single message as it crosses a worker channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    /// JSON-encoded envelope body
    pub body: Bytes,
    /// Zero-copy handles riding next to the body
    pub transfer: Vec<TransferHandle>,
}

impl WireFrame {
    /// Encode an envelope, validating it first. Transfer handles are moved
    /// out of the body onto the frame.
    pub fn encode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        envelope.validate()?;
        let body = serde_json::to_vec(envelope)?;
        Ok(Self {
            body: Bytes::from(body),
            transfer: envelope.transfer.clone(),
        })
    }

    /// Decode and validate the body, re-attaching the frame's handles.
    pub fn decode(&self) -> Result<Envelope, ProtocolError> {
        let mut envelope: Envelope = serde_json::from_slice(&self.body)?;
        envelope.validate()?;
        envelope.transfer = self.transfer.clone();
        Ok(envelope)
    }

    /// Frame with no transfer handles from raw body bytes.
    pub fn from_body(body: Bytes) -> Self {
        Self {
            body,
            transfer: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cancel, Message, Priority, TargetType};
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_roundtrip_preserves_handles() {
        let env = Envelope::new(
            Message::Cancel(Cancel {
                reason: "caller went away".to_string(),
            }),
            TargetType::Worker,
            Priority::Normal,
            1_000,
        )
        .with_transfer(vec![TransferHandle(7), TransferHandle(8)]);

        let frame = WireFrame::encode(&env).unwrap();
        // handles are out-of-band
        assert!(!String::from_utf8_lossy(&frame.body).contains("transfer"));
        assert_eq!(frame.transfer.len(), 2);

        let decoded = frame.decode().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn encode_refuses_invalid_envelope() {
        let mut env = Envelope::new(
            Message::Cancel(Cancel {
                reason: "x".to_string(),
            }),
            TargetType::Worker,
            Priority::Normal,
            1_000,
        );
        env.timeout = 0;
        assert!(WireFrame::encode(&env).is_err());
    }

    #[test]
    fn decode_refuses_garbage() {
        let frame = WireFrame::from_body(Bytes::from_static(b"not json"));
        assert!(matches!(frame.decode(), Err(ProtocolError::Malformed(_))));
    }
}
