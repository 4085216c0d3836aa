use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message type names as they appear in the `type` field.
pub mod kind {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const AUTH_ERROR: &str = "auth-error";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const ROOM_INFO: &str = "room-info";
    pub const USER_JOINED: &str = "user-joined";
    pub const USER_LEFT: &str = "user-left";
    pub const HOST_CHANGED: &str = "host-changed";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const STREAM_ID_MAP: &str = "stream-id-map";
    pub const MUTE_STATUS_CHANGED: &str = "mute-status-changed";
    pub const SPEAKING_STATUS: &str = "speaking_status";
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope type must not be empty")]
    MissingType,
    #[error("payload for {kind} is not a JSON object")]
    PayloadNotObject { kind: String },
}

/// Untyped `{type, payload}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Builds an envelope from any serializable payload.
    pub fn with_payload<T: Serialize>(kind: &str, payload: &T) -> Result<Self, ProtoError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.kind.trim().is_empty() {
            return Err(ProtoError::MissingType);
        }
        Ok(envelope)
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Returns the payload as a mutable object, rejecting scalars and arrays.
    pub fn payload_object_mut(
        &mut self,
    ) -> Result<&mut serde_json::Map<String, Value>, ProtoError> {
        if self.payload.is_null() {
            self.payload = Value::Object(Default::default());
        }
        match &mut self.payload {
            Value::Object(map) => Ok(map),
            _ => Err(ProtoError::PayloadNotObject {
                kind: self.kind.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn missing_payload_defaults_to_null() {
        let envelope = Envelope::parse(r#"{"type":"leave"}"#).expect("parse");
        assert_eq!(envelope.kind, kind::LEAVE);
        assert!(envelope.payload.is_null());
    }

    #[test_timeout::timeout]
    fn empty_type_is_rejected() {
        let err = Envelope::parse(r#"{"type":"  ","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtoError::MissingType));
    }

    #[test_timeout::timeout]
    fn garbage_is_malformed() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test_timeout::timeout]
    fn payload_object_rejects_arrays() {
        let mut envelope = Envelope::new(kind::OFFER, json!([1, 2]));
        assert!(matches!(
            envelope.payload_object_mut(),
            Err(ProtoError::PayloadNotObject { .. })
        ));

        let mut empty = Envelope::new(kind::LEAVE, Value::Null);
        empty
            .payload_object_mut()
            .expect("null promotes to object")
            .insert("senderId".into(), json!("u1"));
        assert_eq!(empty.payload, json!({"senderId": "u1"}));
    }
}
