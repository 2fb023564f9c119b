//! Wire frames and their line codec.

use std::io::{BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::RpcError;

/// Largest accepted frame, including the newline.
pub(crate) const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Request frame.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tether::rpc::RpcRequest;
///
/// let request = RpcRequest::new(7, "kv", "get", json!({"key": "a"}));
/// let line = serde_json::to_string(&request).expect("serialise");
/// assert_eq!(
///     line,
///     r#"{"id":7,"service":"kv","method":"get","params":{"key":"a"}}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    service: String,
    method: String,
    #[serde(default)]
    params: Value,
}

impl RpcRequest {
    /// Builds a request frame.
    #[must_use]
    pub fn new(
        id: u64,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            method: method.into(),
            params,
        }
    }

    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Target service.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Target method.
    #[must_use]
    pub const fn method(&self) -> &str {
        self.method.as_str()
    }

    /// Consumes the request, returning its parameters.
    #[must_use]
    pub fn into_params(self) -> Value {
        self.params
    }
}

/// Error carried by a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcFault {
    code: i64,
    message: String,
}

impl RpcFault {
    /// The named service is not registered.
    pub const UNKNOWN_SERVICE: i64 = -32601;
    /// The service does not implement the method.
    pub const UNKNOWN_METHOD: i64 = -32602;
    /// The parameters did not match the method.
    pub const INVALID_PARAMS: i64 = -32603;
    /// The request frame could not be decoded.
    pub const MALFORMED_REQUEST: i64 = -32700;
    /// The service failed while handling the call.
    pub const INTERNAL: i64 = -32000;

    /// Builds a fault.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Fault for an unknown method on `service`.
    #[must_use]
    pub fn unknown_method(service: &str, method: &str) -> Self {
        Self::new(
            Self::UNKNOWN_METHOD,
            format!("service '{service}' has no method '{method}'"),
        )
    }

    /// Fault for parameters that failed to decode.
    #[must_use]
    pub fn invalid_params(error: &serde_json::Error) -> Self {
        Self::new(Self::INVALID_PARAMS, format!("invalid parameters: {error}"))
    }

    /// Numeric error code.
    #[must_use]
    pub const fn code(&self) -> i64 {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// Response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcFault>,
}

impl RpcResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn failure(id: u64, error: RpcFault) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Converts the frame into the call outcome. A response with neither
    /// field is a null result.
    ///
    /// # Errors
    ///
    /// Returns the carried [`RpcFault`].
    pub fn into_result(self) -> Result<Value, RpcFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Writes `frame` as one JSON line and flushes.
pub(crate) fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), RpcError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Reads one JSON line. Returns `None` on a clean end of stream.
pub(crate) fn read_frame<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, RpcError> {
    let mut line = Vec::new();
    let limit = u64::try_from(MAX_FRAME_BYTES).unwrap_or(u64::MAX);
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && read >= MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(Some(serde_json::from_slice(&line)?))
}
