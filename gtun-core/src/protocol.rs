//! Handshake messages exchanged right after a connection is established.
//!
//! Both messages travel as JSON inside a single frame. After the handshake the
//! same framing carries raw IP packets with no further envelope.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Result of an authorization attempt as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizeStatus {
    Success,
    Failure,
}

/// Client to server: identify with a key and optionally ask for a known address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Previously assigned address, empty on the first connect.
    #[serde(rename = "AccessIP", default)]
    pub access_address: String,
    #[serde(rename = "Key")]
    pub key: String,
}

impl AuthorizeRequest {
    /// Request for a brand new session.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            access_address: String::new(),
            key: key.into(),
        }
    }

    /// Request that asks the server to re-issue `address`.
    pub fn reconnect(address: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            access_address: address.into(),
            key: key.into(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
    }
}

/// Server to client: the verdict and, on success, the assigned address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    #[serde(rename = "AccessIP", default)]
    pub assigned_address: String,
    #[serde(rename = "Status")]
    pub status: AuthorizeStatus,
}

impl AuthorizeResponse {
    /// Successful response carrying `address`.
    pub fn success(address: impl Into<String>) -> Self {
        Self {
            assigned_address: address.into(),
            status: AuthorizeStatus::Success,
        }
    }

    /// Rejection.
    pub fn failure() -> Self {
        Self {
            assigned_address: String::new(),
            status: AuthorizeStatus::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AuthorizeStatus::Success
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
    }
}
