use std::collections::BTreeMap;

use base64::Engine;
use http::Method;
use serde::{Deserialize, Serialize, Serializer};

use super::{RequestId, SessionId};
use crate::error::{ProtocolError, RequestFailure};

/// Ordered header multimap as carried on the bus.
///
/// Serialized as an array of `[name, value]` pairs. Deserializes from either
/// that form or a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "HeaderRepr")]
pub struct Headers(pub Vec<(String, String)>);

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderRepr {
    Pairs(Vec<(String, String)>),
    Map(BTreeMap<String, String>),
}

impl From<HeaderRepr> for Headers {
    fn from(repr: HeaderRepr) -> Self {
        match repr {
            HeaderRepr::Pairs(pairs) => Headers(pairs),
            HeaderRepr::Map(map) => Headers(map.into_iter().collect()),
        }
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl Headers {
    /// First value for `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Headers(pairs)
    }
}

/// Session state as seen by observers of the bus registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Online,
    Degraded,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Online => write!(f, "online"),
            SessionState::Degraded => write!(f, "degraded"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Liveness record announced to the registry on start and every heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub session: SessionId,
    pub status: SessionState,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl Presence {
    pub fn now(session: &SessionId, status: SessionState) -> Self {
        Presence {
            session: session.clone(),
            status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Incoming message types (Edge router -> Agent)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Request {
        id: RequestId,
        method: String,
        path: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_encoding: Option<String>,
    },
    Cancel {
        id: RequestId,
    },
}

/// Outgoing message types (Agent -> Edge router), one response channel per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Meta {
        status: u16,
        headers: Headers,
    },
    Chunk {
        seq: u64,
        data: String,
    },
    End {
        seq_count: u64,
    },
    Error {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// A validated inbound message
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(RequestSpec),
    Cancel(RequestId),
}

/// A validated request, ready to be executed against the local server
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub id: RequestId,
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl InboundMessage {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse and validate a raw bus payload in one step
    pub fn parse(json: &str) -> Result<Inbound, ProtocolError> {
        Self::from_json(json)?.validate()
    }

    /// Check every field and convert into the typed form the dispatcher uses
    pub fn validate(self) -> Result<Inbound, ProtocolError> {
        match self {
            InboundMessage::Request {
                id,
                method,
                path,
                headers,
                body,
                body_encoding,
            } => {
                if id.0.is_empty() {
                    return Err(ProtocolError::EmptyId);
                }
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|_| ProtocolError::InvalidMethod(method.clone()))?;
                if !path.starts_with('/') {
                    return Err(ProtocolError::InvalidPath(path));
                }
                let body = decode_body(body.as_deref(), body_encoding.as_deref())?;

                Ok(Inbound::Request(RequestSpec {
                    id,
                    method,
                    path,
                    headers: headers.0,
                    body,
                }))
            }
            InboundMessage::Cancel { id } => {
                if id.0.is_empty() {
                    return Err(ProtocolError::EmptyId);
                }
                Ok(Inbound::Cancel(id))
            }
        }
    }

    pub fn request(
        id: &str,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Self {
        let (body, body_encoding) = encode_body(body);
        InboundMessage::Request {
            id: RequestId::from(id),
            method: method.to_string(),
            path: path.to_string(),
            headers: Headers(headers),
            body,
            body_encoding,
        }
    }

    pub fn cancel(id: &str) -> Self {
        InboundMessage::Cancel {
            id: RequestId::from(id),
        }
    }
}

impl OutboundMessage {
    pub fn meta(status: u16, headers: Vec<(String, String)>) -> Self {
        OutboundMessage::Meta {
            status,
            headers: Headers(headers),
        }
    }

    pub fn chunk(seq: u64, data: &[u8]) -> Self {
        OutboundMessage::Chunk {
            seq,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    pub fn end(seq_count: u64) -> Self {
        OutboundMessage::End { seq_count }
    }

    pub fn error(failure: &RequestFailure) -> Self {
        OutboundMessage::Error {
            code: failure.code().to_string(),
            detail: failure.detail(),
        }
    }

    /// `end` and `error` close a response channel
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboundMessage::End { .. } | OutboundMessage::Error { .. }
        )
    }

    /// Decoded payload of a `chunk` message
    pub fn chunk_bytes(&self) -> Option<Vec<u8>> {
        match self {
            OutboundMessage::Chunk { data, .. } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn encode_body(body: Option<Vec<u8>>) -> (Option<String>, Option<String>) {
    match body {
        None => (None, None),
        Some(data) => match String::from_utf8(data) {
            Ok(s) => (Some(s), None),
            Err(e) => {
                // Binary data, encode as base64
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(e.into_bytes());
                (Some(encoded), Some("base64".to_string()))
            }
        },
    }
}

pub fn decode_body(
    body: Option<&str>,
    encoding: Option<&str>,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let Some(body) = body else {
        return Ok(None);
    };

    match encoding {
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(body)
            .map(Some)
            .map_err(|e| ProtocolError::InvalidBody(e.to_string())),
        None | Some("utf8") | Some("text") => Ok(Some(body.as_bytes().to_vec())),
        Some(other) => Err(ProtocolError::InvalidBody(format!(
            "unsupported encoding '{}'",
            other
        ))),
    }
}
