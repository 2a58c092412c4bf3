//! Directive and Response payloads.
//!
//! A [`Directive`] rides inside a `directive` envelope under the payload key
//! `"directive"`; its [`Response`] rides inside a `response` envelope under
//! `"response"`. The `directive_id` is the correlation key between the two.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::DEFAULT_DIRECTIVE_TIMEOUT;
use crate::error::{LatticeError, Result};
use crate::message::{Message, MessageType, Payload};

pub const DIRECTIVE_KEY: &str = "directive";
pub const RESPONSE_KEY: &str = "response";

/// A command sent to another node, expecting at most one [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub directive_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub expected_response_type: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
}

fn default_timeout() -> f64 {
    DEFAULT_DIRECTIVE_TIMEOUT.as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Refused,
    Received,
}

/// The single answer to a directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response_id: String,
    pub directive_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
}

impl Directive {
    /// New directive with a random id and the default timeout.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            directive_id: Uuid::new_v4().to_string(),
            command: command.into(),
            parameters: Map::new(),
            context: Map::new(),
            expected_response_type: None,
            timeout_seconds: default_timeout(),
        }
    }

    pub fn with_id(mut self, directive_id: impl Into<String>) -> Self {
        self.directive_id = directive_id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn expecting(mut self, response_type: impl Into<String>) -> Self {
        self.expected_response_type = Some(response_type.into());
        self
    }

    /// Wrap in an unsigned `directive` envelope.
    pub fn to_message(&self, sender_id: &str, recipient_id: Option<&str>) -> Result<Message> {
        let mut payload = Payload::new();
        payload.insert(DIRECTIVE_KEY.into(), serde_json::to_value(self)?);
        let msg = Message::new(MessageType::Directive, sender_id, payload);
        Ok(match recipient_id {
            Some(r) => msg.with_recipient(r),
            None => msg,
        })
    }

    /// Extract from a `directive` envelope.
    pub fn from_message(message: &Message) -> Result<Self> {
        extract(message, MessageType::Directive, DIRECTIVE_KEY)
    }
}

impl Response {
    fn with_status(directive_id: &str, status: ResponseStatus) -> Self {
        Self {
            response_id: Uuid::new_v4().to_string(),
            directive_id: directive_id.to_string(),
            status,
            result: Map::new(),
            error: None,
            processing_time: None,
        }
    }

    pub fn success(directive_id: &str, result: Map<String, Value>) -> Self {
        Self {
            result,
            ..Self::with_status(directive_id, ResponseStatus::Success)
        }
    }

    pub fn error(directive_id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(directive_id, ResponseStatus::Error)
        }
    }

    pub fn refused(directive_id: &str, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::with_status(directive_id, ResponseStatus::Refused)
        }
    }

    /// Plain acknowledgement: `ack_{directive_id}`, status `received`.
    pub fn acknowledged(directive_id: &str) -> Self {
        let mut result = Map::new();
        result.insert(
            "message".into(),
            Value::String("directive received and queued for processing".into()),
        );
        Self {
            response_id: format!("ack_{}", directive_id),
            result,
            ..Self::with_status(directive_id, ResponseStatus::Received)
        }
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time = Some(seconds);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Wrap in an unsigned `response` envelope addressed to `recipient_id`.
    pub fn to_message(&self, sender_id: &str, recipient_id: &str) -> Result<Message> {
        let mut payload = Payload::new();
        payload.insert(RESPONSE_KEY.into(), serde_json::to_value(self)?);
        Ok(Message::new(MessageType::Response, sender_id, payload).with_recipient(recipient_id))
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        extract(message, MessageType::Response, RESPONSE_KEY)
    }
}

fn extract<T: serde::de::DeserializeOwned>(
    message: &Message,
    expected: MessageType,
    key: &str,
) -> Result<T> {
    if message.message_type != expected {
        return Err(LatticeError::Serialization(format!(
            "expected {} message, got {}",
            expected, message.message_type
        )));
    }
    let value = message
        .payload
        .get(key)
        .ok_or_else(|| LatticeError::Serialization(format!("payload has no {:?} entry", key)))?;
    Ok(serde_json::from_value(value.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn directive_envelope_roundtrip() {
        let directive = Directive::new("analyze_spending")
            .with_parameter("window_days", json!(30))
            .with_context("requested_by", json!("core-01"))
            .with_timeout(5.0);
        let msg = directive.to_message("core-01", Some("wealth-01")).unwrap();
        assert_eq!(msg.message_type, MessageType::Directive);
        assert_eq!(msg.recipient_id.as_deref(), Some("wealth-01"));

        let wire = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(wire, msg);
        assert_eq!(Directive::from_message(&wire).unwrap(), directive);

        // A resend keeps the content and changes only the identity.
        let again = wire.resend();
        assert_ne!(again.message_id, wire.message_id);
        assert_eq!(Directive::from_message(&again).unwrap(), directive);
    }

    #[test]
    fn response_envelope_roundtrip() {
        let mut result = Map::new();
        result.insert("score".into(), json!(0.82));
        let response = Response::success("d-1", result).with_processing_time(0.012);
        let msg = response.to_message("wealth-01", "core-01").unwrap();
        assert_eq!(Response::from_message(&msg).unwrap(), response);
        assert_eq!(msg.payload["response"]["status"], "success");
    }

    #[test]
    fn wrong_envelope_type_rejected() {
        let msg = Response::acknowledged("d-1")
            .to_message("a", "b")
            .unwrap();
        assert!(Directive::from_message(&msg).is_err());
    }

    #[test]
    fn missing_payload_key_rejected() {
        let msg = Message::new(MessageType::Directive, "a", Payload::new());
        assert!(matches!(
            Directive::from_message(&msg),
            Err(LatticeError::Serialization(_))
        ));
    }

    #[test]
    fn directive_defaults_apply_on_decode() {
        let d: Directive =
            serde_json::from_value(json!({"directive_id": "x", "command": "ping"})).unwrap();
        assert_eq!(d.timeout_seconds, 30.0);
        assert!(d.parameters.is_empty());
    }

    #[test]
    fn acknowledgement_shape() {
        let ack = Response::acknowledged("d-9");
        assert_eq!(ack.response_id, "ack_d-9");
        assert_eq!(ack.status, ResponseStatus::Received);
        assert!(!ack.is_success());
    }
}
