//! Protocol-neutral error codes and error types.
//!
//! This module provides the error vocabulary shared by every protocol:
//! - [`Code`]: the sixteen RPC status codes
//! - [`Error`]: an RPC error with code, message, details and metadata
//! - [`ErrorDetail`]: a self-describing, protobuf-encoded error detail

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::context::ContextError;

/// Message carried by the error returned for a `304 Not Modified` response.
const NOT_MODIFIED_MESSAGE: &str = "HTTP 304 Not Modified";

/// RPC status codes shared by the Connect and gRPC protocols.
///
/// The numeric values match the gRPC status codes. Success is not a code:
/// a call either returns a value or an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Code {
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// The smallest defined code.
    pub const MIN: Code = Code::Canceled;
    /// The largest defined code.
    pub const MAX: Code = Code::Unauthenticated;

    /// Every code, in numeric order.
    pub const ALL: [Code; 16] = [
        Code::Canceled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Convert a numeric code, normalizing anything outside
    /// `[Code::MIN, Code::MAX]` to [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Code {
        if value < Code::MIN as u32 || value > Code::MAX as u32 {
            return Code::Unknown;
        }
        Code::ALL[(value - Code::MIN as u32) as usize]
    }

    /// The numeric value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Get the string representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`Code`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown error code {0:?}")]
pub struct ParseCodeError(String);

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canceled" | "cancelled" => Ok(Code::Canceled),
            "unknown" => Ok(Code::Unknown),
            "invalid_argument" => Ok(Code::InvalidArgument),
            "deadline_exceeded" => Ok(Code::DeadlineExceeded),
            "not_found" => Ok(Code::NotFound),
            "already_exists" => Ok(Code::AlreadyExists),
            "permission_denied" => Ok(Code::PermissionDenied),
            "resource_exhausted" => Ok(Code::ResourceExhausted),
            "failed_precondition" => Ok(Code::FailedPrecondition),
            "aborted" => Ok(Code::Aborted),
            "out_of_range" => Ok(Code::OutOfRange),
            "unimplemented" => Ok(Code::Unimplemented),
            "internal" => Ok(Code::Internal),
            "unavailable" => Ok(Code::Unavailable),
            "data_loss" => Ok(Code::DataLoss),
            "unauthenticated" => Ok(Code::Unauthenticated),
            other => Err(ParseCodeError(other.to_string())),
        }
    }
}

// ============================================================================
// ErrorDetail
// ============================================================================

/// An in-memory message a detail was built from, kept so protocols can
/// render a human-readable debug form next to the binary payload.
pub trait ResolvedDetail: fmt::Debug + Send + Sync {
    /// Render the message as JSON.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> ResolvedDetail for T
where
    T: Serialize + fmt::Debug + Send + Sync,
{
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A self-describing error detail.
///
/// Details are protobuf messages attached to errors, carried on the wire as
/// `google.protobuf.Any`: a type URL plus the encoded bytes.
///
/// A detail decoded from Connect wire JSON remembers the exact JSON it came
/// from, and re-serializes to those bytes unchanged. Proxies that have no
/// schema for the detail therefore pass it through intact.
#[derive(Clone, Debug)]
pub struct ErrorDetail {
    type_url: String,
    value: Bytes,
    wire_json: Option<String>,
    resolved: Option<Arc<dyn ResolvedDetail>>,
}

impl ErrorDetail {
    /// Create a detail from a type URL and protobuf-encoded bytes.
    pub fn new<S: Into<String>, V: Into<Bytes>>(type_url: S, value: V) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
            wire_json: None,
            resolved: None,
        }
    }

    /// Create a detail from a protobuf message.
    ///
    /// The message is kept alongside its encoding so that protocols with a
    /// textual error form can include a debug rendering of it.
    pub fn from_message<M>(message: &M) -> Self
    where
        M: prost::Message + prost::Name + Serialize + Clone + fmt::Debug + 'static,
    {
        Self {
            type_url: M::type_url(),
            value: Bytes::from(message.encode_to_vec()),
            wire_json: None,
            resolved: Some(Arc::new(message.clone())),
        }
    }

    /// Create a detail that was decoded from wire JSON.
    ///
    /// `raw_json` is the exact JSON object the detail was parsed from; it is
    /// emitted verbatim whenever the detail is serialized again.
    pub fn from_wire<S, V, J>(type_url: S, value: V, raw_json: J) -> Self
    where
        S: Into<String>,
        V: Into<Bytes>,
        J: Into<String>,
    {
        Self {
            type_url: type_url.into(),
            value: value.into(),
            wire_json: Some(raw_json.into()),
            resolved: None,
        }
    }

    /// The full type URL, e.g. `type.googleapis.com/google.rpc.RetryInfo`.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// The fully-qualified message name, with any URL prefix removed.
    pub fn type_name(&self) -> &str {
        match self.type_url.rfind('/') {
            Some(idx) => &self.type_url[idx + 1..],
            None => &self.type_url,
        }
    }

    /// The protobuf-encoded value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The JSON this detail was decoded from, if it came off the wire.
    pub fn wire_json(&self) -> Option<&str> {
        self.wire_json.as_deref()
    }

    /// Best-effort JSON rendering of the resolved message.
    ///
    /// Returns `None` when the detail was built from raw bytes or when the
    /// rendering fails.
    pub fn debug_json(&self) -> Option<serde_json::Value> {
        let resolved = self.resolved.as_ref()?;
        match resolved.to_json() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(
                    type_url = %self.type_url,
                    error = %err,
                    "error detail debug rendering failed"
                );
                None
            }
        }
    }

    /// Decode the detail into a concrete protobuf message.
    pub fn decode<M>(&self) -> Result<M, Error>
    where
        M: prost::Message + prost::Name + Default,
    {
        if self.type_name() != M::full_name() {
            return Err(Error::new(
                Code::Internal,
                format!(
                    "error detail is a {}, not a {}",
                    self.type_name(),
                    M::full_name()
                ),
            ));
        }
        M::decode(self.value.as_ref()).map_err(|err| {
            Error::new(Code::Internal, format!("decode error detail: {err}"))
        })
    }
}

impl PartialEq for ErrorDetail {
    fn eq(&self, other: &Self) -> bool {
        self.type_url == other.type_url && self.value == other.value
    }
}

// ============================================================================
// Error
// ============================================================================

/// An RPC error: a code, a human-readable message, ordered details and
/// optional metadata.
///
/// Errors built locally with [`Error::new`] carry their metadata onto the
/// wire when serialized. Errors received from a peer ([`Error::from_wire`])
/// keep their metadata for inspection but do not re-emit it, so a proxy
/// never echoes a server's headers back as its own.
#[derive(Clone, Debug)]
pub struct Error {
    code: Code,
    message: String,
    details: Vec<ErrorDetail>,
    meta: HeaderMap,
    wire: bool,
    not_modified: bool,
}

impl Error {
    /// Create a locally constructed error.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            meta: HeaderMap::new(),
            wire: false,
            not_modified: false,
        }
    }

    /// Create an error with just a code.
    pub fn from_code(code: Code) -> Self {
        Self::new(code, String::new())
    }

    /// Create an error that was received from the peer.
    pub fn from_wire<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            wire: true,
            ..Self::new(code, message)
        }
    }

    /// The error returned to clients when a GET request is answered with
    /// `304 Not Modified`.
    pub fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Self::from_wire(Code::Unknown, NOT_MODIFIED_MESSAGE)
        }
    }

    /// Map an I/O failure to an error, keeping timeouts and interruptions
    /// distinguishable from other transport failures.
    pub fn from_io(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::TimedOut => Code::DeadlineExceeded,
            io::ErrorKind::Interrupted => Code::Canceled,
            _ => Code::Unknown,
        };
        Self::new(code, err.to_string())
    }

    /// Get the error code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the error message. Empty when the error carries only a code.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error details, in the order they were added.
    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    /// Add a detail.
    pub fn add_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Add a detail in place.
    pub fn push_detail(&mut self, detail: ErrorDetail) {
        self.details.push(detail);
    }

    /// Get the metadata headers.
    pub fn meta(&self) -> &HeaderMap {
        &self.meta
    }

    /// Get mutable access to the metadata headers.
    pub fn meta_mut(&mut self) -> &mut HeaderMap {
        &mut self.meta
    }

    /// Add a metadata header. Invalid names or values are dropped.
    pub fn with_meta<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key_str = key.as_ref();
        let val_str = value.as_ref();

        match HeaderName::from_bytes(key_str.as_bytes()) {
            Ok(name) => match HeaderValue::from_str(val_str) {
                Ok(val) => {
                    self.meta.append(name, val);
                }
                Err(e) => {
                    tracing::debug!(
                        key = key_str,
                        value = val_str,
                        error = %e,
                        "invalid header value, metadata dropped"
                    );
                }
            },
            Err(e) => {
                tracing::debug!(
                    key = key_str,
                    error = %e,
                    "invalid header name, metadata dropped"
                );
            }
        }
        self
    }

    /// Whether this error was received from the peer rather than built locally.
    pub fn is_wire_error(&self) -> bool {
        self.wire
    }

    /// Whether this error stands for a `304 Not Modified` response.
    pub fn is_not_modified(&self) -> bool {
        self.not_modified
    }

    // Convenience constructors

    /// Create a canceled error.
    pub fn canceled<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Canceled, message)
    }

    /// Create an unknown error.
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Create a not found error.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// Create an unimplemented error.
    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Create an unavailable error.
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            return write!(f, "{}", self.code);
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        let code = match err {
            ContextError::Canceled => Code::Canceled,
            ContextError::DeadlineExceeded => Code::DeadlineExceeded,
        };
        Error::new(code, err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}
