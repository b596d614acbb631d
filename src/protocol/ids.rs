//! Type-safe ID wrappers for protocol identifiers.
//!
//! These newtypes prevent accidentally mixing up different ID types
//! at compile time (e.g., passing a SessionId where a RequestId is expected).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation id for one relayed HTTP request, assigned by the edge router
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

/// Identifier of one agent session, generated when the agent starts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a random session id (`ses_` followed by 24 hex digits)
    pub fn generate() -> Self {
        let bytes: [u8; 12] = rand::thread_rng().gen();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        SessionId(format!("ses_{}", hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public subdomain owned by a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subdomain(pub String);

impl Subdomain {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel the edge router publishes requests on
    pub fn request_channel(&self) -> String {
        format!("tunnel:{}:req", self.0)
    }

    /// Ephemeral channel carrying the response for one request
    pub fn response_channel(&self, id: &RequestId) -> String {
        format!("tunnel:{}:res:{}", self.0, id.0)
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Subdomain {
    fn from(s: String) -> Self {
        Subdomain(s)
    }
}

impl From<&str> for Subdomain {
    fn from(s: &str) -> Self {
        Subdomain(s.to_string())
    }
}
