//! Request/response envelopes and JSON batch framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PushError;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The physical frame was not a JSON array of request envelopes.
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    /// A response envelope could not be serialized.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A client request envelope.
///
/// `seq` is an opaque client-chosen correlation value echoed back in the
/// response. `immed` asks the server to bypass outbound batching for the
/// answer to this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub seq: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub immed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Request {
    /// Create a request with an attached data payload.
    #[must_use]
    pub fn new(cmd: impl Into<String>, seq: i64, data: Option<serde_json::Value>) -> Self {
        Self {
            cmd: cmd.into(),
            seq,
            immed: false,
            data,
        }
    }
}

/// A server response (or push) envelope.
///
/// `code` is zero on success, otherwise one of the negative wire codes from
/// [`PushError::code`]. Pushes originated by the server carry `seq` 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub cmd: String,
    pub seq: i64,
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn ok(cmd: impl Into<String>, seq: i64, data: Option<serde_json::Value>) -> Self {
        Self {
            cmd: cmd.into(),
            seq,
            code: 0,
            msg: String::new(),
            data,
        }
    }

    /// A coded failure response for the given error.
    #[must_use]
    pub fn failure(cmd: impl Into<String>, seq: i64, err: &PushError) -> Self {
        Self {
            cmd: cmd.into(),
            seq,
            code: err.code(),
            msg: err.to_string(),
            data: None,
        }
    }

    /// Serialize this envelope as a single logical frame.
    ///
    /// The result is one JSON object; the transport layer assembles physical
    /// frames (`[f1,f2,...]`) from these.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(ProtocolError::Encode)
    }
}

/// Decode one physical frame into its logical requests.
///
/// A frame that is not a JSON array of well-formed request envelopes (a JSON
/// `null` element included) is a protocol error; callers treat it as fatal.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] on any malformed input.
pub fn decode_batch(raw: &[u8]) -> Result<Vec<Request>, ProtocolError> {
    serde_json::from_slice(raw).map_err(ProtocolError::Decode)
}
