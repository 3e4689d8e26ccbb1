//! Wire envelope stored in every stream entry.
//!
//! Each entry has a single `payload` field holding
//! `{"data": "<base64 job bytes>", "enqueued_at": "<RFC3339>"}`.

use crate::error::{QueueError, QueueResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream field carrying the encoded envelope.
pub const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    data: String,
    enqueued_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap `data`, stamping the current time.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            enqueued_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> QueueResult<String> {
        let wire = WireEnvelope {
            data: STANDARD.encode(&self.data),
            enqueued_at: self.enqueued_at,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(raw: &str) -> QueueResult<Self> {
        let wire: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| QueueError::envelope(format!("invalid envelope json: {e}")))?;
        let data = STANDARD
            .decode(wire.data.as_bytes())
            .map_err(|e| QueueError::envelope(format!("invalid base64 data: {e}")))?;

        Ok(Self {
            data,
            enqueued_at: wire.enqueued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let envelope = Envelope {
            data: br#"{"id":7}"#.to_vec(),
            enqueued_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let encoded = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["data"], "eyJpZCI6N30=");
        assert_eq!(json["enqueued_at"], "2024-05-01T12:00:00Z");

        assert_eq!(Envelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(QueueError::Envelope { .. })
        ));
        assert!(matches!(
            Envelope::decode(r#"{"data":"***","enqueued_at":"2024-05-01T12:00:00Z"}"#),
            Err(QueueError::Envelope { .. })
        ));
        assert!(matches!(
            Envelope::decode(r#"{"data":"eyJpZCI6N30=","enqueued_at":"yesterday"}"#),
            Err(QueueError::Envelope { .. })
        ));
    }
}
