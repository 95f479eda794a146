//! Wire types shared between the warden agent and its controller.
//!
//! The protocol is strictly one exchange per TCP connection: the controller
//! sends a raw JSON request, the agent answers with a length-prefixed JSON
//! response and half-closes its write side.

pub mod envelope;
pub mod token;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command-specific fields carried alongside `token` and `request` in the
/// request body.
pub type Fields = serde_json::Map<String, Value>;

/// A single controller request. `token` and `request` default to empty when
/// absent, so a request missing them fails authentication or dispatch
/// rather than decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub token: String,
    #[serde(rename = "request", default)]
    pub command: String,
    #[serde(flatten)]
    pub fields: Fields,
}

/// The response envelope returned for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}
