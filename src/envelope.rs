//! Wire envelope — the versioned message wrapper for every overlay exchange.
//!
//! Requests, responses, and gossip all travel as an [`Envelope`]. The body is
//! a oneof-style pair of opaque payloads (`request` / `response`); exactly one
//! side must be present as dictated by the message type, and the decoder
//! rejects the rest. Unknown message types survive decoding so that newer
//! peers can talk past older ones; consumers reject them explicitly.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid envelope json: {0}")]
    Json(String),
    #[error("ambiguous body: both request and response variants present")]
    AmbiguousBody,
    #[error("missing body variant: {0} envelope carries no {0} payload")]
    MissingBody(&'static str),
    #[error("request envelope has empty id")]
    MissingId,
    #[error("gossip envelope carries an id")]
    UnexpectedId,
}

/// Closed enumeration of overlay message types. Unknown numeric values decode
/// into [`MessageType::Unknown`] and are rejected by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum MessageType {
    PeerIdentityRequest,
    PeerIdentityResponse,
    ChatCompletionRequest,
    ChatCompletionResponse,
    ImageGenerationRequest,
    ImageGenerationResponse,
    AiProject,
    Unknown(u32),
}

impl From<u32> for MessageType {
    fn from(v: u32) -> Self {
        match v {
            1 => MessageType::PeerIdentityRequest,
            2 => MessageType::PeerIdentityResponse,
            3 => MessageType::ChatCompletionRequest,
            4 => MessageType::ChatCompletionResponse,
            5 => MessageType::ImageGenerationRequest,
            6 => MessageType::ImageGenerationResponse,
            7 => MessageType::AiProject,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(t: MessageType) -> u32 {
        match t {
            MessageType::PeerIdentityRequest => 1,
            MessageType::PeerIdentityResponse => 2,
            MessageType::ChatCompletionRequest => 3,
            MessageType::ChatCompletionResponse => 4,
            MessageType::ImageGenerationRequest => 5,
            MessageType::ImageGenerationResponse => 6,
            MessageType::AiProject => 7,
            MessageType::Unknown(other) => other,
        }
    }
}

impl MessageType {
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::PeerIdentityRequest
                | MessageType::ChatCompletionRequest
                | MessageType::ImageGenerationRequest
        )
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::PeerIdentityResponse
                | MessageType::ChatCompletionResponse
                | MessageType::ImageGenerationResponse
        )
    }

    /// The response type paired with this request type, if any.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::PeerIdentityRequest => Some(MessageType::PeerIdentityResponse),
            MessageType::ChatCompletionRequest => Some(MessageType::ChatCompletionResponse),
            MessageType::ImageGenerationRequest => Some(MessageType::ImageGenerationResponse),
            _ => None,
        }
    }
}

/// Oneof-style body: a request payload, a response payload, never both.
/// Gossip rides in the `request` slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub request: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<u8>>,
}

impl Body {
    pub fn request(payload: Vec<u8>) -> Self {
        Body { request: Some(payload), response: None }
    }

    pub fn response(payload: Vec<u8>) -> Self {
        Body { request: None, response: Some(payload) }
    }

    /// The single payload this body carries, regardless of variant.
    pub fn payload(&self) -> &[u8] {
        self.request
            .as_deref()
            .or(self.response.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub client_version: String,
    pub timestamp: i64,
    /// Random per-request identifier; empty on fire-and-forget gossip.
    #[serde(default)]
    pub id: String,
    pub sender: String,
    /// Empty means broadcast.
    #[serde(default)]
    pub receiver: String,
    #[serde(default, with = "base64_vec")]
    pub sender_pub_key: Vec<u8>,
    #[serde(default, with = "base64_vec")]
    pub signature: Vec<u8>,
    pub message_type: MessageType,
    #[serde(default)]
    pub body: Body,
    #[serde(default)]
    pub result_code: u32,
    #[serde(default)]
    pub result_message: String,
}

impl Envelope {
    /// A request envelope with a fresh random id, addressed to `receiver`
    /// (empty for broadcast fan-out).
    pub fn request(message_type: MessageType, sender: &iroh::NodeId, receiver: &str, payload: Vec<u8>) -> Self {
        Envelope {
            client_version: CLIENT_VERSION.to_string(),
            timestamp: unix_now(),
            id: new_request_id(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            sender_pub_key: sender.as_bytes().to_vec(),
            signature: Vec::new(),
            message_type,
            body: Body::request(payload),
            result_code: 0,
            result_message: String::new(),
        }
    }

    /// A response envelope correlated to `request` by id, addressed back to
    /// its sender.
    pub fn response_to(
        request: &Envelope,
        message_type: MessageType,
        sender: &iroh::NodeId,
        payload: Vec<u8>,
        result_code: u32,
        result_message: String,
    ) -> Self {
        Envelope {
            client_version: CLIENT_VERSION.to_string(),
            timestamp: unix_now(),
            id: request.id.clone(),
            sender: sender.to_string(),
            receiver: request.sender.clone(),
            sender_pub_key: sender.as_bytes().to_vec(),
            signature: Vec::new(),
            message_type,
            body: Body::response(payload),
            result_code,
            result_message,
        }
    }

    /// A gossip envelope: no id, no receiver.
    pub fn gossip(message_type: MessageType, sender: &iroh::NodeId, payload: Vec<u8>) -> Self {
        Envelope {
            client_version: CLIENT_VERSION.to_string(),
            timestamp: unix_now(),
            id: String::new(),
            sender: sender.to_string(),
            receiver: String::new(),
            sender_pub_key: sender.as_bytes().to_vec(),
            signature: Vec::new(),
            message_type,
            body: Body::request(payload),
            result_code: 0,
            result_message: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(self).map_err(|e| DecodeError::Json(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let env: Envelope =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
        env.validate()?;
        Ok(env)
    }

    /// Body/id invariants shared by the encoder and decoder.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.body.request.is_some() && self.body.response.is_some() {
            return Err(DecodeError::AmbiguousBody);
        }
        if self.message_type.is_request() {
            if self.body.response.is_some() || self.body.request.is_none() {
                return Err(DecodeError::MissingBody("request"));
            }
            if self.id.is_empty() {
                return Err(DecodeError::MissingId);
            }
        } else if self.message_type.is_response() {
            if self.body.request.is_some() || self.body.response.is_none() {
                return Err(DecodeError::MissingBody("response"));
            }
            if self.id.is_empty() {
                return Err(DecodeError::MissingId);
            }
        } else if self.message_type == MessageType::AiProject && !self.id.is_empty() {
            return Err(DecodeError::UnexpectedId);
        }
        Ok(())
    }

    /// Sign the canonical encoding (signature field emptied) with the node's
    /// identity key.
    pub fn sign(&mut self, key: &iroh::SecretKey) -> Result<(), DecodeError> {
        self.signature = Vec::new();
        let bytes = self.encode()?;
        self.signature = key.sign(&bytes).to_bytes().to_vec();
        Ok(())
    }

    /// Verify the signature against the embedded sender public key.
    pub fn verify(&self) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(self.sender_pub_key.as_slice()) else {
            return false;
        };
        let Ok(public) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        let Ok(bytes) = unsigned.encode() else {
            return false;
        };
        public.verify_strict(&bytes, &sig).is_ok()
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::fill(&mut bytes);
    hex::encode(bytes)
}

mod base64_vec {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        match s {
            Some(s) => STANDARD.decode(s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> iroh::NodeId {
        iroh::SecretKey::from_bytes(&[7u8; 32]).public().into()
    }

    #[test]
    fn request_round_trips() {
        let env = Envelope::request(
            MessageType::ChatCompletionRequest,
            &test_id(),
            "some-peer",
            b"{\"model\":\"m\"}".to_vec(),
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(env, decoded);
        assert!(!decoded.id.is_empty());
    }

    #[test]
    fn response_round_trips_with_result_fields() {
        let req = Envelope::request(MessageType::PeerIdentityRequest, &test_id(), "", vec![1]);
        let resp = Envelope::response_to(
            &req,
            MessageType::PeerIdentityResponse,
            &test_id(),
            vec![2, 3],
            0,
            "ok".into(),
        );
        let decoded = Envelope::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(resp, decoded);
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.receiver, req.sender);
    }

    #[test]
    fn gossip_round_trips_with_empty_id() {
        let env = Envelope::gossip(MessageType::AiProject, &test_id(), b"snapshot".to_vec());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(env, decoded);
        assert!(decoded.id.is_empty());
        assert!(decoded.receiver.is_empty());
    }

    #[test]
    fn ambiguous_body_rejected() {
        let mut env = Envelope::request(MessageType::ChatCompletionRequest, &test_id(), "", vec![1]);
        env.body.response = Some(vec![2]);
        let bytes = serde_json::to_vec(&env).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(DecodeError::AmbiguousBody));
    }

    #[test]
    fn wrong_variant_rejected() {
        let mut env = Envelope::request(MessageType::ChatCompletionRequest, &test_id(), "", vec![1]);
        env.body = Body::response(vec![1]);
        let bytes = serde_json::to_vec(&env).unwrap();
        assert_eq!(
            Envelope::decode(&bytes),
            Err(DecodeError::MissingBody("request"))
        );
    }

    #[test]
    fn empty_request_id_rejected() {
        let mut env = Envelope::request(MessageType::PeerIdentityRequest, &test_id(), "", vec![1]);
        env.id = String::new();
        let bytes = serde_json::to_vec(&env).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(DecodeError::MissingId));
    }

    #[test]
    fn gossip_with_id_rejected() {
        let mut env = Envelope::gossip(MessageType::AiProject, &test_id(), vec![1]);
        env.id = "abc".into();
        let bytes = serde_json::to_vec(&env).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(DecodeError::UnexpectedId));
    }

    #[test]
    fn unknown_type_survives_decoding() {
        let mut env = Envelope::gossip(MessageType::AiProject, &test_id(), vec![1]);
        env.message_type = MessageType::Unknown(99);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type, MessageType::Unknown(99));
    }

    #[test]
    fn sign_and_verify() {
        let key = iroh::SecretKey::from_bytes(&[9u8; 32]);
        let mut env = Envelope::gossip(MessageType::AiProject, &key.public().into(), vec![1, 2]);
        env.sign(&key).unwrap();
        assert!(env.verify());

        env.result_message = "tampered".into();
        assert!(!env.verify());
    }
}
