//! # Wire envelope for boundary ops
//!
//! Every op crossing the host/guest boundary carries a UTF-8 JSON payload.
//! Results come back wrapped in an `Envelope`: `data` when the op produced a
//! value, `error` when the op ran but failed logically. The channel call
//! succeeding and the op succeeding are two different things, and the
//! envelope is where that difference lives.
//!
//! ## Philosophy
//!
//! - **One decode step**: higher layers never parse raw channel bytes; they
//!   go through [`decode_data`] so failure surfaces the same way everywhere.
//! - **Tagged results over thrown errors**: the `{error, data}` shape is a
//!   result type on the wire, and it maps onto one here.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Codec and protocol-level failures.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A value failed to serialize to the wire format.
    Encode(String),
    /// Payload was not a valid UTF-8 JSON envelope.
    Malformed(String),
    /// The envelope's `error` field was set: the op logically failed.
    Op(String),
    /// The envelope carried neither `error` nor `data`.
    MissingData,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Malformed(msg) => write!(f, "Malformed envelope: {}", msg),
            Self::Op(msg) => write!(f, "Op error: {}", msg),
            Self::MissingData => write!(f, "Envelope carried neither error nor data"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The `error` half of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpError {
    pub message: String,
}

impl OpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Structured result of every boundary op.
///
/// Exactly one of `error`/`data` is meaningful per call; [`Envelope::into_data`]
/// enforces that when unwrapping, giving `error` precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: serde::de::DeserializeOwned"))]
pub struct Envelope<D> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OpError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
}

impl<D> Envelope<D> {
    /// Success envelope around `data`.
    pub fn ok(data: D) -> Self {
        Self { error: None, data: Some(data) }
    }

    /// Failure envelope carrying `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self { error: Some(OpError::new(message)), data: None }
    }

    /// Unwraps the envelope: an error fails the call, otherwise the data is
    /// the op's result.
    pub fn into_data(self) -> Result<D> {
        if let Some(error) = self.error {
            return Err(Error::Op(error.message));
        }
        self.data.ok_or(Error::MissingData)
    }
}

/// Serializes a bare request/response document (no envelope) to wire bytes.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
}

/// Serializes an envelope to wire bytes.
pub fn encode<D: Serialize>(envelope: &Envelope<D>) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| Error::Encode(e.to_string()))
}

/// Parses wire bytes back into an envelope.
pub fn decode<D: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<D>> {
    serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))
}

/// Decodes and unwraps in one step: the path every higher component takes.
pub fn decode_data<D: DeserializeOwned>(bytes: &[u8]) -> Result<D> {
    decode::<D>(bytes)?.into_data()
}

/// Failure envelope as bytes. Infallible so op implementations always have a
/// well-formed error to hand back.
pub fn fail_bytes(message: &str) -> Vec<u8> {
    encode(&Envelope::<()>::fail(message))
        .unwrap_or_else(|_| br#"{"error":{"message":"envelope encode failure"}}"#.to_vec())
}

/// Response with no fields; serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests;
