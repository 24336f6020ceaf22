//! The Connect protocol.
//!
//! Unary calls are plain HTTP: the message is the body (or, for GET, the
//! query string) and errors are JSON with a matching HTTP status. Streaming
//! calls frame messages in envelopes and finish with an end-stream envelope
//! carrying the trailers and any error as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use scalpel_core::{
    BufferPool, COMPRESSION_IDENTITY, CallContext, Code, Codec, CompressionPool, Envelope,
    EnvelopeReader, EnvelopeWriter, Error, ErrorDetail, FLAG_END_STREAM, Message, ReadOutcome,
    wrap_envelope,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    HEADER_VARY, NegotiatedCompression, URL_SAFE_INDIFFERENT, decode_binary_header,
    merge_non_protocol_headers, negotiate_compression, request_content_type,
};
use crate::config::{HandlerConfig, MessageLimits};
use crate::interceptor::StreamingHandlerConn;
use crate::spec::{Spec, StreamType};

pub const UNARY_HEADER_COMPRESSION: HeaderName = CONTENT_ENCODING;
pub const UNARY_HEADER_ACCEPT_COMPRESSION: HeaderName = ACCEPT_ENCODING;
/// Unary responses carry trailers as headers with this prefix.
pub const UNARY_TRAILER_PREFIX: &str = "trailer-";
pub const STREAMING_HEADER_COMPRESSION: HeaderName =
    HeaderName::from_static("connect-content-encoding");
pub const STREAMING_HEADER_ACCEPT_COMPRESSION: HeaderName =
    HeaderName::from_static("connect-accept-encoding");
pub const HEADER_TIMEOUT: HeaderName = HeaderName::from_static("connect-timeout-ms");
pub const HEADER_PROTOCOL_VERSION: HeaderName =
    HeaderName::from_static("connect-protocol-version");
pub const PROTOCOL_VERSION: &str = "1";

pub const UNARY_CONTENT_TYPE_PREFIX: &str = "application/";
pub const UNARY_CONTENT_TYPE_JSON: &str = "application/json";
pub const STREAMING_CONTENT_TYPE_PREFIX: &str = "application/connect+";

pub const QUERY_ENCODING: &str = "encoding";
pub const QUERY_MESSAGE: &str = "message";
pub const QUERY_BASE64: &str = "base64";
pub const QUERY_COMPRESSION: &str = "compression";
pub const QUERY_CONNECT: &str = "connect";
pub const QUERY_CONNECT_VALUE: &str = "v1";

const UNARY_CONTENT_TYPE_JSON_CHARSET: &str = "application/json; charset=utf-8";
const MAX_TIMEOUT_DIGITS: usize = 10;

// ============================================================================
// Status mapping
// ============================================================================

/// The HTTP status a unary error is sent with.
pub fn code_to_http(code: Code) -> StatusCode {
    let status = match code {
        Code::Canceled => 499,
        Code::Unknown => 500,
        Code::InvalidArgument => 400,
        Code::DeadlineExceeded => 504,
        Code::NotFound => 404,
        Code::AlreadyExists => 409,
        Code::PermissionDenied => 403,
        Code::ResourceExhausted => 429,
        Code::FailedPrecondition => 400,
        Code::Aborted => 409,
        Code::OutOfRange => 400,
        Code::Unimplemented => 501,
        Code::Internal => 500,
        Code::Unavailable => 503,
        Code::DataLoss => 500,
        Code::Unauthenticated => 401,
    };
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// The code implied by an HTTP status when the body holds no Connect error.
pub fn http_to_code(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

// ============================================================================
// Content types and protocol version
// ============================================================================

/// The codec name embedded in a Connect content type.
pub fn codec_for_content_type(stream_type: StreamType, content_type: &str) -> &str {
    let prefix = if stream_type == StreamType::Unary {
        UNARY_CONTENT_TYPE_PREFIX
    } else {
        STREAMING_CONTENT_TYPE_PREFIX
    };
    content_type.strip_prefix(prefix).unwrap_or(content_type)
}

/// Check the content type of a unary response against the request codec.
///
/// Non-200 responses only need to be JSON, since they carry an error. A
/// `304` answer to a GET becomes [`Error::not_modified`].
pub fn validate_unary_response_content_type(
    request_codec: &str,
    method: &Method,
    status: StatusCode,
    status_message: &str,
    response_content_type: &str,
) -> Result<(), Error> {
    if status != StatusCode::OK {
        if method == Method::GET && status == StatusCode::NOT_MODIFIED {
            return Err(Error::not_modified());
        }
        if response_content_type == UNARY_CONTENT_TYPE_JSON
            || response_content_type == UNARY_CONTENT_TYPE_JSON_CHARSET
        {
            return Ok(());
        }
        return Err(Error::new(http_to_code(status), status_message));
    }

    let expected = format!("{UNARY_CONTENT_TYPE_PREFIX}{request_codec}");
    let Some(response_codec) = response_content_type.strip_prefix(UNARY_CONTENT_TYPE_PREFIX) else {
        return Err(Error::new(
            Code::Unknown,
            format!("invalid content-type: {response_content_type:?}; expecting {expected:?}"),
        ));
    };
    if response_codec == request_codec || (is_json(response_codec) && is_json(request_codec)) {
        return Ok(());
    }
    Err(Error::new(
        Code::Internal,
        format!("invalid content-type: {response_content_type:?}; expecting {expected:?}"),
    ))
}

/// Check the content type of a streaming response against the request codec.
pub fn validate_stream_response_content_type(
    request_codec: &str,
    stream_type: StreamType,
    response_content_type: &str,
) -> Result<(), Error> {
    let expected = format!("{STREAMING_CONTENT_TYPE_PREFIX}{request_codec}");
    if !response_content_type.starts_with(STREAMING_CONTENT_TYPE_PREFIX) {
        return Err(Error::new(
            Code::Unknown,
            format!("invalid content-type: {response_content_type:?}; expecting {expected:?}"),
        ));
    }
    let response_codec = codec_for_content_type(stream_type, response_content_type);
    if response_codec != request_codec {
        return Err(Error::new(
            Code::Internal,
            format!("invalid content-type: {response_content_type:?}; expecting {expected:?}"),
        ));
    }
    Ok(())
}

fn is_json(codec: &str) -> bool {
    codec == scalpel_core::CODEC_NAME_JSON || codec == scalpel_core::CODEC_NAME_JSON_CHARSET_UTF8
}

/// Check the protocol version a request declares.
///
/// GET requests declare it with the `connect` query parameter, POST requests
/// with the `Connect-Protocol-Version` header. A declared version must be
/// the supported one; declaring none is only an error when `required`.
pub fn check_protocol_version<B>(request: &Request<B>, required: bool) -> Result<(), Error> {
    let method = request.method();
    if method == Method::GET {
        let connect = match request.uri().query() {
            Some(query) => connect_query_param(query)?,
            None => None,
        };
        match connect.as_deref().filter(|v| !v.is_empty()) {
            None if required => Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "missing required query parameter: set {QUERY_CONNECT} to {QUERY_CONNECT_VALUE:?}"
                ),
            )),
            Some(version) if version != QUERY_CONNECT_VALUE => Err(Error::new(
                Code::InvalidArgument,
                format!("{QUERY_CONNECT} must be {QUERY_CONNECT_VALUE:?}: got {version:?}"),
            )),
            _ => Ok(()),
        }
    } else if method == Method::POST {
        let version = request
            .headers()
            .get(HEADER_PROTOCOL_VERSION)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .filter(|v| !v.is_empty());
        match version {
            None if required => Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "missing required header: set Connect-Protocol-Version to {PROTOCOL_VERSION:?}"
                ),
            )),
            Some(version) if version != PROTOCOL_VERSION => Err(Error::new(
                Code::InvalidArgument,
                format!("Connect-Protocol-Version must be {PROTOCOL_VERSION:?}: got {version:?}"),
            )),
            _ => Ok(()),
        }
    } else {
        Err(Error::new(
            Code::InvalidArgument,
            format!("unsupported method: {:?}", method.as_str()),
        ))
    }
}

/// The first `connect` parameter of a query. Other pairs are not parsed, so
/// a malformed unrelated key cannot hide the version.
fn connect_query_param(query: &str) -> Result<Option<String>, Error> {
    let Some(pair) = query
        .split('&')
        .find(|pair| pair.split('=').next() == Some(QUERY_CONNECT))
    else {
        return Ok(None);
    };
    let parsed: GetQuery = serde_qs::from_str(pair).map_err(|err| {
        Error::new(Code::InvalidArgument, format!("invalid query: {err}"))
    })?;
    Ok(parsed.connect)
}

// ============================================================================
// Timeouts
// ============================================================================

/// Parse `Connect-Timeout-Ms`. Absent or zero means no timeout.
pub fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, Error> {
    let Some(value) = headers.get(HEADER_TIMEOUT) else {
        return Ok(None);
    };
    let value = String::from_utf8_lossy(value.as_bytes());
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() > MAX_TIMEOUT_DIGITS {
        return Err(Error::new(
            Code::InvalidArgument,
            format!("parse timeout: {value:?} has >{MAX_TIMEOUT_DIGITS} digits"),
        ));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::new(
            Code::InvalidArgument,
            format!("parse timeout: invalid value {value:?}"),
        ));
    }
    let millis: u64 = value.parse().map_err(|err| {
        Error::new(Code::InvalidArgument, format!("parse timeout: {err}"))
    })?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

/// Render a timeout for `Connect-Timeout-Ms`, rounding up to whole
/// milliseconds. `None` when the value does not fit the header.
pub fn encode_timeout(timeout: Duration) -> Option<HeaderValue> {
    let millis = timeout.as_nanos().div_ceil(1_000_000).max(1);
    let text = millis.to_string();
    if text.len() > MAX_TIMEOUT_DIGITS {
        return None;
    }
    HeaderValue::from_str(&text).ok()
}

// ============================================================================
// Wire errors
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectWireError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Vec<ConnectWireDetail>>,
}

/// One detail exactly as it appears in the JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
struct ConnectWireDetail(Box<RawValue>);

#[derive(Serialize)]
struct DetailOut<'a> {
    #[serde(rename = "type")]
    type_name: &'a str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DetailIn {
    #[serde(rename = "type", default)]
    type_url: String,
    #[serde(default)]
    value: String,
}

impl ConnectWireError {
    fn from_error(err: &Error) -> Result<Self, serde_json::Error> {
        let details = err
            .details()
            .iter()
            .map(ConnectWireDetail::from_detail)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            code: Some(err.code().as_str().to_string()),
            message: (!err.message().is_empty()).then(|| err.message().to_string()),
            details: (!details.is_empty()).then_some(details),
        })
    }

    /// Unrecognized codes become [`Code::Unknown`].
    fn into_error(self) -> Result<Error, Error> {
        let code = self
            .code
            .as_deref()
            .and_then(|code| code.parse().ok())
            .unwrap_or(Code::Unknown);
        let mut err = Error::from_wire(code, self.message.unwrap_or_default());
        for detail in self.details.unwrap_or_default() {
            err.push_detail(detail.into_detail()?);
        }
        Ok(err)
    }
}

impl ConnectWireDetail {
    fn from_detail(detail: &ErrorDetail) -> Result<Self, serde_json::Error> {
        if let Some(json) = detail.wire_json() {
            return RawValue::from_string(json.to_string()).map(Self);
        }
        let out = DetailOut {
            type_name: detail.type_name(),
            value: STANDARD_NO_PAD.encode(detail.value()),
            debug: detail.debug_json(),
        };
        serde_json::value::to_raw_value(&out).map(Self)
    }

    fn into_detail(self) -> Result<ErrorDetail, Error> {
        let raw = self.0.get();
        let fields: DetailIn = serde_json::from_str(raw).map_err(|err| {
            Error::new(Code::Internal, format!("unmarshal error detail: {err}"))
        })?;
        let type_url = if fields.type_url.contains('/') {
            fields.type_url
        } else {
            format!("type.googleapis.com/{}", fields.type_url)
        };
        let value = decode_binary_header(&fields.value).map_err(|err| {
            Error::new(Code::Internal, format!("decode error detail value: {err}"))
        })?;
        Ok(ErrorDetail::from_wire(type_url, value, raw))
    }
}

/// Serialize an error as Connect JSON.
///
/// Details decoded from the wire are emitted exactly as they were received.
pub fn marshal_error(err: &Error) -> Result<Bytes, Error> {
    ConnectWireError::from_error(err)
        .and_then(|wire| serde_json::to_vec(&wire))
        .map(Bytes::from)
        .map_err(|err| Error::new(Code::Internal, format!("marshal error: {err}")))
}

/// Parse a Connect JSON error. The result is marked as received from the
/// peer.
pub fn unmarshal_error(data: &[u8]) -> Result<Error, Error> {
    let wire: ConnectWireError = serde_json::from_slice(data)
        .map_err(|err| Error::new(Code::Internal, format!("unmarshal error: {err}")))?;
    wire.into_error()
}

/// The response for a failed unary call: the error as JSON, with the
/// status picked by [`code_to_http`].
pub fn unary_error_response(err: &Error) -> Result<Response<Body>, Error> {
    let mut response = Response::new(Body::from(marshal_error(err)?));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(UNARY_CONTENT_TYPE_JSON));
    if !err.is_wire_error() {
        merge_non_protocol_headers(headers, err.meta());
    }
    *response.status_mut() = code_to_http(err.code());
    Ok(response)
}

/// Move unary trailers into `Trailer-` prefixed response headers.
pub fn trailers_to_unary_headers(trailer: &HeaderMap, headers: &mut HeaderMap) {
    for (name, value) in trailer {
        let prefixed = format!("{UNARY_TRAILER_PREFIX}{}", name.as_str());
        match HeaderName::from_bytes(prefixed.as_bytes()) {
            Ok(prefixed) => {
                headers.append(prefixed, value.clone());
            }
            Err(err) => tracing::debug!(name = %name, error = %err, "trailer dropped"),
        }
    }
}

/// Split `Trailer-` prefixed headers out of a unary response.
pub fn unary_headers_to_trailers(headers: &mut HeaderMap) -> HeaderMap {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(UNARY_TRAILER_PREFIX))
        .cloned()
        .collect();
    let mut trailer = HeaderMap::new();
    for name in names {
        let Ok(stripped) =
            HeaderName::from_bytes(&name.as_str().as_bytes()[UNARY_TRAILER_PREFIX.len()..])
        else {
            continue;
        };
        for value in headers.get_all(&name) {
            trailer.append(stripped.clone(), value.clone());
        }
        headers.remove(&name);
    }
    trailer
}

// ============================================================================
// End of stream
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct EndStreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ConnectWireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, Vec<String>>>,
}

fn headers_to_metadata(headers: &HeaderMap) -> Option<BTreeMap<String, Vec<String>>> {
    let mut metadata: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => metadata
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string()),
            Err(_) => tracing::debug!(name = %name, "non-text trailer value dropped"),
        }
    }
    (!metadata.is_empty()).then_some(metadata)
}

fn metadata_to_headers(metadata: BTreeMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in metadata {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(name, "invalid trailer name dropped");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.append(header_name.clone(), value);
                }
                Err(_) => tracing::debug!(name, "invalid trailer value dropped"),
            }
        }
    }
    headers
}

/// The JSON payload of an end-stream envelope.
///
/// A locally built error contributes its non-protocol metadata to the
/// trailers.
pub fn end_stream_payload(err: Option<&Error>, trailer: &HeaderMap) -> Result<Vec<u8>, Error> {
    let mut trailer = trailer.clone();
    let mut message = EndStreamMessage::default();
    if let Some(err) = err {
        if !err.is_wire_error() {
            merge_non_protocol_headers(&mut trailer, err.meta());
        }
        message.error = Some(ConnectWireError::from_error(err).map_err(|err| {
            Error::new(Code::Internal, format!("marshal end stream: {err}"))
        })?);
    }
    message.metadata = headers_to_metadata(&trailer);
    serde_json::to_vec(&message)
        .map_err(|err| Error::new(Code::Internal, format!("marshal end stream: {err}")))
}

/// A complete end-stream envelope.
pub fn end_stream_frame(err: Option<&Error>, trailer: &HeaderMap) -> Result<Bytes, Error> {
    wrap_envelope(FLAG_END_STREAM, &end_stream_payload(err, trailer)?)
}

// ============================================================================
// Streaming marshaling
// ============================================================================

/// Writes the messages of a Connect stream.
#[derive(Debug)]
pub struct ConnectStreamingMarshaler<W> {
    writer: EnvelopeWriter<W>,
    codec: Arc<dyn Codec>,
    buffers: BufferPool,
}

impl<W: AsyncWrite + Unpin> ConnectStreamingMarshaler<W> {
    pub fn new(writer: EnvelopeWriter<W>, codec: Arc<dyn Codec>) -> Self {
        Self {
            writer,
            codec,
            buffers: BufferPool::global().clone(),
        }
    }

    pub async fn marshal(&mut self, ctx: &CallContext, message: &dyn Message) -> Result<(), Error> {
        let mut buf = self.buffers.get();
        self.codec
            .marshal(message, &mut buf)
            .map_err(|err| Error::new(Code::Internal, format!("marshal message: {err}")))?;
        self.writer.marshal(ctx, &buf).await
    }

    /// Finish the stream with the trailers and, on failure, the error.
    pub async fn marshal_end_stream(
        &mut self,
        ctx: &CallContext,
        err: Option<&Error>,
        trailer: &HeaderMap,
    ) -> Result<(), Error> {
        let payload = end_stream_payload(err, trailer)?;
        self.writer
            .write(ctx, &Envelope::new(FLAG_END_STREAM, payload))
            .await
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// What [`ConnectStreamingUnmarshaler::unmarshal`] read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRead {
    /// A message was decoded.
    Message,
    /// The end-stream envelope arrived; see
    /// [`ConnectStreamingUnmarshaler::trailer`] and
    /// [`ConnectStreamingUnmarshaler::end_stream_error`].
    EndStream,
    /// The body ended without an end-stream envelope.
    Eof,
}

/// Reads the messages of a Connect stream.
#[derive(Debug)]
pub struct ConnectStreamingUnmarshaler<R> {
    reader: EnvelopeReader<R>,
    codec: Arc<dyn Codec>,
    trailer: HeaderMap,
    end_stream_error: Option<Error>,
}

impl<R: AsyncRead + Unpin> ConnectStreamingUnmarshaler<R> {
    pub fn new(reader: EnvelopeReader<R>, codec: Arc<dyn Codec>) -> Self {
        Self {
            reader,
            codec,
            trailer: HeaderMap::new(),
            end_stream_error: None,
        }
    }

    pub async fn unmarshal(
        &mut self,
        ctx: &CallContext,
        message: &mut dyn Message,
    ) -> Result<StreamRead, Error> {
        let envelope = match self.reader.read(ctx).await? {
            ReadOutcome::Eof => return Ok(StreamRead::Eof),
            ReadOutcome::Message(data) => {
                self.codec.unmarshal(&data, message).map_err(|err| {
                    Error::new(Code::InvalidArgument, format!("unmarshal message: {err}"))
                })?;
                return Ok(StreamRead::Message);
            }
            ReadOutcome::Special(envelope) => envelope,
        };

        if !envelope.is_set(FLAG_END_STREAM) {
            return Err(Error::new(
                Code::Internal,
                format!("protocol error: invalid envelope flags {}", envelope.flags),
            ));
        }
        let end: EndStreamMessage = serde_json::from_slice(&envelope.data).map_err(|err| {
            Error::new(Code::Internal, format!("unmarshal end stream message: {err}"))
        })?;
        self.trailer = metadata_to_headers(end.metadata.unwrap_or_default());
        self.end_stream_error = end
            .error
            .map(ConnectWireError::into_error)
            .transpose()
            .map_err(|err| {
                Error::new(
                    Code::Internal,
                    format!("unmarshal end stream message: {}", err.message()),
                )
            })?;
        Ok(StreamRead::EndStream)
    }

    /// Trailers from the end-stream envelope, with lowercased names.
    pub fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    /// The error from the end-stream envelope, if it held one.
    pub fn end_stream_error(&self) -> Option<&Error> {
        self.end_stream_error.as_ref()
    }
}

// ============================================================================
// Unary marshaling
// ============================================================================

/// Query parameters of a unary GET request. Fields are in the order they
/// are serialized.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Encodes the single message of a unary request or response.
#[derive(Clone, Debug)]
pub struct ConnectUnaryMarshaler {
    codec: Arc<dyn Codec>,
    compression: Option<CompressionPool>,
    compress_min_bytes: usize,
    send_max_bytes: Option<usize>,
}

impl ConnectUnaryMarshaler {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            compression: None,
            compress_min_bytes: 0,
            send_max_bytes: None,
        }
    }

    /// Compress messages of at least `min_bytes` with `pool`.
    pub fn with_compression(mut self, pool: Option<CompressionPool>, min_bytes: usize) -> Self {
        self.compression = pool;
        self.compress_min_bytes = min_bytes;
        self
    }

    pub fn with_send_max_bytes(mut self, max: Option<usize>) -> Self {
        self.send_max_bytes = max;
        self
    }

    fn encode(&self, message: &dyn Message) -> Result<bytes::BytesMut, Error> {
        let mut buf = bytes::BytesMut::new();
        self.codec
            .marshal(message, &mut buf)
            .map_err(|err| Error::new(Code::Internal, format!("marshal message: {err}")))?;
        Ok(buf)
    }

    fn check_send_size(&self, what: &str, size: usize) -> Result<(), Error> {
        match self.send_max_bytes {
            Some(max) if size > max => Err(Error::new(
                Code::ResourceExhausted,
                format!("{what} size {size} exceeds sendMaxBytes {max}"),
            )),
            _ => Ok(()),
        }
    }

    /// Encode `message` as a request or response body, setting
    /// `Content-Encoding` in `header` when the body is compressed.
    pub fn marshal(&self, message: &dyn Message, header: &mut HeaderMap) -> Result<Bytes, Error> {
        let data = self.encode(message)?;
        match &self.compression {
            Some(pool) if data.len() >= self.compress_min_bytes => {
                let compressed = pool.compress(&data)?;
                self.check_send_size("compressed message", compressed.len())?;
                header.insert(
                    UNARY_HEADER_COMPRESSION,
                    HeaderValue::from_static(pool.name()),
                );
                Ok(Bytes::copy_from_slice(&compressed))
            }
            _ => {
                self.check_send_size("message", data.len())?;
                Ok(data.freeze())
            }
        }
    }

    /// The URL of a GET request carrying `message` in its query.
    ///
    /// The message is compressed only when it would otherwise exceed the
    /// send limit. Any query already on `base` is replaced.
    pub fn get_url(&self, base: &Uri, message: &dyn Message) -> Result<Uri, Error> {
        let data = self.encode(message)?;
        let mut query = GetQuery {
            connect: Some(QUERY_CONNECT_VALUE.to_string()),
            encoding: Some(self.codec.name().to_string()),
            ..GetQuery::default()
        };

        let payload = match self.send_max_bytes {
            Some(max) if data.len() > max => {
                let Some(pool) = &self.compression else {
                    return Err(Error::new(
                        Code::ResourceExhausted,
                        format!(
                            "message size {} exceeds sendMaxBytes {max}: enabling request compression may help",
                            data.len()
                        ),
                    ));
                };
                let compressed = pool.compress(&data)?;
                self.check_send_size("compressed message", compressed.len())?;
                query.compression = Some(pool.name().to_string());
                compressed.to_vec()
            }
            _ => data.to_vec(),
        };

        if self.codec.is_binary() || query.compression.is_some() {
            query.message = Some(URL_SAFE_INDIFFERENT.encode(&payload));
            query.base64 = Some("1".to_string());
        } else {
            let text = String::from_utf8(payload).map_err(|err| {
                Error::new(Code::Internal, format!("marshal message: {err}"))
            })?;
            query.message = Some(text);
        }

        let encoded = serde_qs::to_string(&query)
            .map_err(|err| Error::new(Code::Internal, format!("encode query: {err}")))?;
        let path_and_query = PathAndQuery::try_from(format!("{}?{encoded}", base.path()))
            .map_err(|err| Error::new(Code::Internal, format!("build url: {err}")))?;
        let mut parts = base.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(|err| Error::new(Code::Internal, format!("build url: {err}")))
    }
}

/// Decodes the single message of a unary request or response.
#[derive(Clone, Debug)]
pub struct ConnectUnaryUnmarshaler {
    codec: Arc<dyn Codec>,
    compression: Option<CompressionPool>,
    read_max_bytes: Option<usize>,
}

impl ConnectUnaryUnmarshaler {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            compression: None,
            read_max_bytes: None,
        }
    }

    /// Decompress payloads with `pool`.
    pub fn with_compression(mut self, pool: Option<CompressionPool>) -> Self {
        self.compression = pool;
        self
    }

    pub fn with_read_max_bytes(mut self, max: Option<usize>) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Decode a complete payload.
    pub fn unmarshal(&self, data: &[u8], message: &mut dyn Message) -> Result<(), Error> {
        if let Some(max) = self.read_max_bytes
            && data.len() > max
        {
            return Err(Error::new(
                Code::ResourceExhausted,
                format!("message size {} is larger than configured max {max}", data.len()),
            ));
        }
        let decompressed;
        let data = match &self.compression {
            Some(pool) => {
                decompressed = pool.decompress(data, self.read_max_bytes)?;
                &decompressed[..]
            }
            None => data,
        };
        self.codec
            .unmarshal(data, message)
            .map_err(|err| Error::new(Code::InvalidArgument, format!("unmarshal message: {err}")))
    }

    /// Read `body` to the end, within the read limit and `ctx`, and decode it.
    pub async fn unmarshal_body<B>(
        &self,
        ctx: &CallContext,
        body: B,
        message: &mut dyn Message,
    ) -> Result<(), Error>
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limit = self.read_max_bytes.unwrap_or(usize::MAX);
        let collected = ctx
            .run(Limited::new(body, limit).collect())
            .await?
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    Error::new(
                        Code::ResourceExhausted,
                        format!("message is larger than configured max {limit}"),
                    )
                } else {
                    Error::new(Code::Unknown, format!("read message: {err}"))
                }
            })?;
        self.unmarshal(&collected.to_bytes(), message)
    }

    /// Decode the message carried in the query of a GET request.
    pub fn unmarshal_query(&self, query: &str, message: &mut dyn Message) -> Result<(), Error> {
        let query: GetQuery = serde_qs::from_str(query).map_err(|err| {
            Error::new(Code::InvalidArgument, format!("invalid query: {err}"))
        })?;
        let text = query.message.unwrap_or_default();
        if query.base64.as_deref() == Some("1") {
            let data = URL_SAFE_INDIFFERENT.decode(text.as_bytes()).map_err(|err| {
                Error::new(Code::InvalidArgument, format!("decode message: {err}"))
            })?;
            self.unmarshal(&data, message)
        } else {
            self.unmarshal(text.as_bytes(), message)
        }
    }
}

// ============================================================================
// Handler side
// ============================================================================

/// Everything a handler agreed with the client about one call.
#[derive(Clone, Debug)]
pub struct ConnectNegotiation {
    pub stream_type: StreamType,
    pub codec: Arc<dyn Codec>,
    pub compression: NegotiatedCompression,
    pub timeout: Option<Duration>,
    /// Headers to send back before any message.
    pub response_header: HeaderMap,
    request_pool: Option<CompressionPool>,
    response_pool: Option<CompressionPool>,
    compress_min_bytes: usize,
    limits: MessageLimits,
}

impl ConnectNegotiation {
    /// Validate a Connect request and pick its codec, compression and
    /// timeout from `config`.
    pub fn negotiate<B>(request: &Request<B>, config: &HandlerConfig) -> Result<Self, Error> {
        let stream_type = config.spec().stream_type;
        check_protocol_version(request, config.require_connect_protocol_header())?;
        let headers = request.headers();
        let is_get = request.method() == Method::GET;
        let query: GetQuery = if is_get {
            serde_qs::from_str(request.uri().query().unwrap_or_default()).map_err(|err| {
                Error::new(Code::InvalidArgument, format!("invalid query: {err}"))
            })?
        } else {
            GetQuery::default()
        };

        let codec_name = if is_get {
            query.encoding.clone().ok_or_else(|| {
                Error::new(
                    Code::InvalidArgument,
                    format!("missing required query parameter: set {QUERY_ENCODING}"),
                )
            })?
        } else {
            let content_type = request_content_type(request);
            codec_for_content_type(stream_type, &content_type).to_string()
        };
        let codecs = config.codecs();
        let codec = codecs.get(&codec_name).ok_or_else(|| {
            Error::new(
                Code::Unimplemented,
                format!(
                    "unsupported codec {codec_name:?}: supported codecs are {}",
                    codecs.names().join(",")
                ),
            )
        })?;

        let header_text = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let (sent, accept) = match (stream_type, is_get) {
            (StreamType::Unary, true) => (
                query.compression.clone(),
                header_text(&UNARY_HEADER_ACCEPT_COMPRESSION),
            ),
            (StreamType::Unary, false) => (
                header_text(&UNARY_HEADER_COMPRESSION),
                header_text(&UNARY_HEADER_ACCEPT_COMPRESSION),
            ),
            _ => (
                header_text(&STREAMING_HEADER_COMPRESSION),
                header_text(&STREAMING_HEADER_ACCEPT_COMPRESSION),
            ),
        };
        let pools = config.compression_pools();
        let compression = negotiate_compression(pools, sent.as_deref(), accept.as_deref())?;
        let timeout = parse_timeout(headers)?;

        let mut response_header = HeaderMap::new();
        let (content_type, accept_header) = if stream_type == StreamType::Unary {
            (
                format!("{UNARY_CONTENT_TYPE_PREFIX}{}", codec.name()),
                UNARY_HEADER_ACCEPT_COMPRESSION,
            )
        } else {
            (
                format!("{STREAMING_CONTENT_TYPE_PREFIX}{}", codec.name()),
                STREAMING_HEADER_ACCEPT_COMPRESSION,
            )
        };
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response_header.insert(CONTENT_TYPE, value);
        }
        if !pools.is_empty()
            && let Ok(value) = HeaderValue::from_str(pools.comma_separated_names())
        {
            response_header.insert(accept_header, value);
        }
        if stream_type != StreamType::Unary
            && compression.response != COMPRESSION_IDENTITY
            && let Ok(value) = HeaderValue::from_str(&compression.response)
        {
            response_header.insert(STREAMING_HEADER_COMPRESSION, value);
        }
        if is_get {
            response_header.insert(HEADER_VARY, HeaderValue::from_static("Accept-Encoding"));
        }

        Ok(Self {
            stream_type,
            codec,
            request_pool: pools.get(&compression.request).cloned(),
            response_pool: pools.get(&compression.response).cloned(),
            compression,
            timeout,
            response_header,
            compress_min_bytes: config.compress_min_bytes(),
            limits: config.limits(),
        })
    }

    /// Decodes the request of a unary call.
    pub fn unary_unmarshaler(&self) -> ConnectUnaryUnmarshaler {
        ConnectUnaryUnmarshaler::new(self.codec.clone())
            .with_compression(self.request_pool.clone())
            .with_read_max_bytes(self.limits.read_max())
    }

    /// Encodes the response of a unary call.
    pub fn unary_marshaler(&self) -> ConnectUnaryMarshaler {
        ConnectUnaryMarshaler::new(self.codec.clone())
            .with_compression(self.response_pool.clone(), self.compress_min_bytes)
            .with_send_max_bytes(self.limits.send_max())
    }

    /// The handler's end of a streaming call over `reader` and `writer`.
    pub fn streaming_conn<R, W>(
        &self,
        spec: Spec,
        ctx: CallContext,
        request_header: HeaderMap,
        reader: R,
        writer: W,
    ) -> ConnectStreamingHandlerConn<R, W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let reader = EnvelopeReader::new(reader)
            .with_compression(self.request_pool.clone())
            .with_read_max_bytes(self.limits.read_max());
        let writer = EnvelopeWriter::new(writer)
            .with_compression(self.response_pool.clone(), self.compress_min_bytes)
            .with_send_max_bytes(self.limits.send_max());
        ConnectStreamingHandlerConn {
            spec,
            ctx,
            request_header,
            response_header: self.response_header.clone(),
            response_trailer: HeaderMap::new(),
            unmarshaler: ConnectStreamingUnmarshaler::new(reader, self.codec.clone()),
            marshaler: ConnectStreamingMarshaler::new(writer, self.codec.clone()),
        }
    }
}

/// The handler's end of a Connect stream.
#[derive(Debug)]
pub struct ConnectStreamingHandlerConn<R, W> {
    spec: Spec,
    ctx: CallContext,
    request_header: HeaderMap,
    response_header: HeaderMap,
    response_trailer: HeaderMap,
    unmarshaler: ConnectStreamingUnmarshaler<R>,
    marshaler: ConnectStreamingMarshaler<W>,
}

impl<R, W> ConnectStreamingHandlerConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Write the end-stream envelope with the response trailers and return
    /// the underlying writer.
    pub async fn close(mut self, err: Option<&Error>) -> Result<W, Error> {
        self.marshaler
            .marshal_end_stream(&self.ctx, err, &self.response_trailer)
            .await?;
        Ok(self.marshaler.into_inner())
    }
}

impl<R, W> StreamingHandlerConn for ConnectStreamingHandlerConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn request_header(&self) -> &HeaderMap {
        &self.request_header
    }

    fn receive<'a>(
        &'a mut self,
        message: &'a mut dyn Message,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            // Clients never send an end-stream envelope, so either way the
            // request side is done.
            match self.unmarshaler.unmarshal(&self.ctx, message).await? {
                StreamRead::Message => Ok(true),
                StreamRead::EndStream | StreamRead::Eof => Ok(false),
            }
        })
    }

    fn response_header(&mut self) -> &mut HeaderMap {
        &mut self.response_header
    }

    fn response_trailer(&mut self) -> &mut HeaderMap {
        &mut self.response_trailer
    }

    fn send<'a>(&'a mut self, message: &'a dyn Message) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.marshaler.marshal(&self.ctx, message).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{HandlerOption, with_compression, with_read_max_bytes};
    use crate::testing::{Ping, ReverseCompressor};
    use scalpel_core::{ProtoBinaryCodec, ProtoJsonCodec};

    fn json() -> Arc<dyn Codec> {
        Arc::new(ProtoJsonCodec::new())
    }

    fn proto() -> Arc<dyn Codec> {
        Arc::new(ProtoBinaryCodec)
    }

    fn ping(text: &str) -> Ping {
        Ping {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_code_to_http() {
        assert_eq!(code_to_http(Code::Canceled).as_u16(), 499);
        assert_eq!(code_to_http(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(code_to_http(Code::ResourceExhausted), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(code_to_http(Code::Unimplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(code_to_http(Code::DataLoss), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code_to_http(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_http_to_code() {
        assert_eq!(http_to_code(StatusCode::BAD_REQUEST), Code::Internal);
        assert_eq!(http_to_code(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(http_to_code(StatusCode::BAD_GATEWAY), Code::Unavailable);
        assert_eq!(http_to_code(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }

    #[test]
    fn test_error_round_trips_every_code() {
        for code in Code::ALL {
            let err = Error::new(code, "boom")
                .add_detail(ErrorDetail::new("type.googleapis.com/acme.Info", &b"abc"[..]));
            let data = marshal_error(&err).unwrap();
            let parsed = unmarshal_error(&data).unwrap();
            assert_eq!(parsed.code(), code);
            assert_eq!(parsed.message(), "boom");
            assert_eq!(parsed.details(), err.details());
            assert!(parsed.is_wire_error());
        }
    }

    #[test]
    fn test_marshal_error_shape() {
        let err = Error::from_code(Code::NotFound);
        assert_eq!(marshal_error(&err).unwrap(), r#"{"code":"not_found"}"#);

        let err = Error::new(Code::Internal, "x")
            .add_detail(ErrorDetail::new("type.googleapis.com/acme.Info", &b"fo"[..]));
        assert_eq!(
            marshal_error(&err).unwrap(),
            r#"{"code":"internal","message":"x","details":[{"type":"acme.Info","value":"Zm8"}]}"#
        );
    }

    /// Encodes fine but refuses to render as JSON.
    #[derive(Clone, PartialEq, prost::Message)]
    struct Opaque {
        #[prost(string, tag = "1")]
        note: String,
    }

    impl prost::Name for Opaque {
        const NAME: &'static str = "Opaque";
        const PACKAGE: &'static str = "scalpel.test";
    }

    impl serde::Serialize for Opaque {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no json form"))
        }
    }

    #[test]
    fn test_marshal_error_debug_rendering() {
        let ping = Ping {
            text: "hi".to_string(),
        };
        let err = Error::new(Code::Internal, "x").add_detail(ErrorDetail::from_message(&ping));
        assert_eq!(
            marshal_error(&err).unwrap(),
            r#"{"code":"internal","message":"x","details":[{"type":"scalpel.test.Ping","value":"CgJoaQ","debug":{"text":"hi"}}]}"#
        );

        let opaque = Opaque {
            note: "n".to_string(),
        };
        let err = Error::new(Code::Internal, "x").add_detail(ErrorDetail::from_message(&opaque));
        assert_eq!(
            marshal_error(&err).unwrap(),
            r#"{"code":"internal","message":"x","details":[{"type":"scalpel.test.Opaque","value":"CgFu"}]}"#
        );
    }

    #[test]
    fn test_wire_detail_reserialized_verbatim() {
        let input = r#"{"code":"internal","details":[{"type": "x/y", "value":"Zm9v"}]}"#;
        let err = unmarshal_error(input.as_bytes()).unwrap();
        assert_eq!(err.details()[0].type_url(), "x/y");
        assert_eq!(err.details()[0].value(), b"foo");
        assert_eq!(marshal_error(&err).unwrap(), input);
    }

    #[test]
    fn test_unmarshal_error_is_lenient() {
        let err = unmarshal_error(br#"{"code":"not_a_code","message":"m"}"#).unwrap();
        assert_eq!(err.code(), Code::Unknown);

        let err = unmarshal_error(br#"{"code":null}"#).unwrap();
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(err.message(), "");

        let err = unmarshal_error(br#"{"code":"aborted","details":[{"type":"acme.Info","value":"Zm8="}]}"#)
            .unwrap();
        assert_eq!(err.details()[0].type_url(), "type.googleapis.com/acme.Info");
        assert_eq!(err.details()[0].value(), b"fo");
    }

    #[test]
    fn test_unary_error_response() {
        let err = Error::new(Code::PermissionDenied, "no")
            .with_meta("x-reason", "policy")
            .with_meta("content-length", "99");
        let response = unary_error_response(&err).unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()["x-reason"], "policy");
        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn test_unary_trailer_headers() {
        let mut trailer = HeaderMap::new();
        trailer.append("x-a", HeaderValue::from_static("1"));
        trailer.append("x-a", HeaderValue::from_static("2"));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/proto"));
        trailers_to_unary_headers(&trailer, &mut headers);
        assert_eq!(headers.get_all("trailer-x-a").iter().count(), 2);

        let split = unary_headers_to_trailers(&mut headers);
        assert_eq!(split, trailer);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_validate_unary_response_content_type() {
        let ok = |codec, ct| {
            validate_unary_response_content_type(codec, &Method::POST, StatusCode::OK, "200 OK", ct)
        };
        assert!(ok("proto", "application/proto").is_ok());
        assert!(ok("json", "application/json; charset=utf-8").is_ok());
        assert!(ok("json; charset=utf-8", "application/json").is_ok());
        assert_eq!(ok("proto", "text/html").unwrap_err().code(), Code::Unknown);
        let mismatch = ok("proto", "application/json").unwrap_err();
        assert_eq!(mismatch.code(), Code::Internal);
        assert_eq!(
            mismatch.message(),
            "invalid content-type: \"application/json\"; expecting \"application/proto\""
        );
    }

    #[test]
    fn test_validate_unary_error_status() {
        let not_modified = validate_unary_response_content_type(
            "proto",
            &Method::GET,
            StatusCode::NOT_MODIFIED,
            "304 Not Modified",
            "",
        )
        .unwrap_err();
        assert!(not_modified.is_not_modified());
        assert_eq!(not_modified.code(), Code::Unknown);

        assert!(
            validate_unary_response_content_type(
                "proto",
                &Method::POST,
                StatusCode::NOT_FOUND,
                "404 Not Found",
                "application/json"
            )
            .is_ok()
        );

        let err = validate_unary_response_content_type(
            "proto",
            &Method::POST,
            StatusCode::SERVICE_UNAVAILABLE,
            "503 Service Unavailable",
            "text/html",
        )
        .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(err.message(), "503 Service Unavailable");
    }

    #[test]
    fn test_validate_stream_response_content_type() {
        assert!(
            validate_stream_response_content_type(
                "proto",
                StreamType::ServerStream,
                "application/connect+proto"
            )
            .is_ok()
        );
        let wrong_prefix = validate_stream_response_content_type(
            "proto",
            StreamType::ServerStream,
            "application/proto",
        )
        .unwrap_err();
        assert_eq!(wrong_prefix.code(), Code::Unknown);
        let wrong_codec = validate_stream_response_content_type(
            "proto",
            StreamType::BiDiStream,
            "application/connect+json",
        )
        .unwrap_err();
        assert_eq!(wrong_codec.code(), Code::Internal);
    }

    #[test]
    fn test_check_protocol_version() {
        let get = |uri: &str| Request::get(uri).body(()).unwrap();
        assert!(check_protocol_version(&get("/svc/M?connect=v1"), true).is_ok());
        assert!(check_protocol_version(&get("/svc/M"), false).is_ok());
        assert_eq!(
            check_protocol_version(&get("/svc/M"), true).unwrap_err().message(),
            "missing required query parameter: set connect to \"v1\""
        );
        assert_eq!(
            check_protocol_version(&get("/svc/M?connect=v2"), false)
                .unwrap_err()
                .message(),
            "connect must be \"v1\": got \"v2\""
        );

        let post = Request::post("/svc/M")
            .header(HEADER_PROTOCOL_VERSION, "2")
            .body(())
            .unwrap();
        let err = check_protocol_version(&post, false).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "Connect-Protocol-Version must be \"1\": got \"2\"");

        let err = check_protocol_version(&get("/svc/M?connect=v2&x[=1"), false).unwrap_err();
        assert_eq!(err.message(), "connect must be \"v1\": got \"v2\"");
        let err = check_protocol_version(&get("/svc/M?x[=1&connect=v2"), true).unwrap_err();
        assert_eq!(err.message(), "connect must be \"v1\": got \"v2\"");
        assert!(check_protocol_version(&get("/svc/M?x[=1&connect=v1&connect=v2"), true).is_ok());
        assert!(check_protocol_version(&get("/svc/M?x[=1"), false).is_ok());

        let put = Request::put("/svc/M").body(()).unwrap();
        assert_eq!(
            check_protocol_version(&put, false).unwrap_err().message(),
            "unsupported method: \"PUT\""
        );
    }

    #[test]
    fn test_parse_timeout() {
        let headers = |value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_TIMEOUT, HeaderValue::from_static(value));
            headers
        };
        assert_eq!(parse_timeout(&HeaderMap::new()).unwrap(), None);
        assert_eq!(parse_timeout(&headers("0")).unwrap(), None);
        assert_eq!(
            parse_timeout(&headers("1500")).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_timeout(&headers("12345678901")).unwrap_err().code(),
            Code::InvalidArgument
        );
        assert_eq!(
            parse_timeout(&headers("-5")).unwrap_err().code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn test_encode_timeout() {
        assert_eq!(encode_timeout(Duration::from_millis(250)).unwrap(), "250");
        assert_eq!(encode_timeout(Duration::from_micros(1)).unwrap(), "1");
        assert!(encode_timeout(Duration::from_secs(100_000_000)).is_none());
    }

    #[test]
    fn test_end_stream_merges_local_error_metadata() {
        let mut trailer = HeaderMap::new();
        trailer.insert("x-trailer", HeaderValue::from_static("t"));
        let err = Error::new(Code::Aborted, "stop").with_meta("x-meta", "m");
        let payload = end_stream_payload(Some(&err), &trailer).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["error"]["code"], "aborted");
        assert_eq!(value["metadata"]["x-trailer"][0], "t");
        assert_eq!(value["metadata"]["x-meta"][0], "m");

        let wire = Error::from_wire(Code::Aborted, "stop").with_meta("x-meta", "m");
        let payload = end_stream_payload(Some(&wire), &HeaderMap::new()).unwrap();
        assert_eq!(payload, br#"{"error":{"code":"aborted","message":"stop"}}"#);
    }

    #[test]
    fn test_end_stream_frame_without_error() {
        let frame = end_stream_frame(None, &HeaderMap::new()).unwrap();
        assert_eq!(&frame[..], b"\x02\x00\x00\x00\x02{}");
    }

    #[tokio::test]
    async fn test_streaming_round_trip_with_end_stream() {
        let ctx = CallContext::background();
        let mut marshaler = ConnectStreamingMarshaler::new(EnvelopeWriter::new(Vec::new()), json());
        marshaler.marshal(&ctx, &ping("one")).await.unwrap();
        let mut trailer = HeaderMap::new();
        trailer.insert("x-count", HeaderValue::from_static("1"));
        let err = Error::new(Code::ResourceExhausted, "quota");
        marshaler
            .marshal_end_stream(&ctx, Some(&err), &trailer)
            .await
            .unwrap();
        let wire = marshaler.into_inner();

        let mut unmarshaler = ConnectStreamingUnmarshaler::new(EnvelopeReader::new(&wire[..]), json());
        let mut message = Ping::default();
        assert_eq!(
            unmarshaler.unmarshal(&ctx, &mut message).await.unwrap(),
            StreamRead::Message
        );
        assert_eq!(message.text, "one");
        assert_eq!(
            unmarshaler.unmarshal(&ctx, &mut message).await.unwrap(),
            StreamRead::EndStream
        );
        assert_eq!(unmarshaler.trailer()["x-count"], "1");
        let end = unmarshaler.end_stream_error().unwrap();
        assert_eq!(end.code(), Code::ResourceExhausted);
        assert_eq!(end.message(), "quota");
        assert_eq!(
            unmarshaler.unmarshal(&ctx, &mut message).await.unwrap(),
            StreamRead::Eof
        );
    }

    #[tokio::test]
    async fn test_end_stream_trailer_names_are_canonicalized() {
        let ctx = CallContext::background();
        let frame = wrap_envelope(FLAG_END_STREAM, br#"{"metadata":{"X-Mixed-Case":["v"]}}"#).unwrap();
        let mut unmarshaler = ConnectStreamingUnmarshaler::new(EnvelopeReader::new(&frame[..]), json());
        let mut message = Ping::default();
        unmarshaler.unmarshal(&ctx, &mut message).await.unwrap();
        assert_eq!(unmarshaler.trailer()["x-mixed-case"], "v");
        assert!(unmarshaler.end_stream_error().is_none());
    }

    #[tokio::test]
    async fn test_special_envelope_without_end_stream_flag() {
        let ctx = CallContext::background();
        let frame = wrap_envelope(0b1000_0000, b"{}").unwrap();
        let mut unmarshaler = ConnectStreamingUnmarshaler::new(EnvelopeReader::new(&frame[..]), json());
        let err = unmarshaler
            .unmarshal(&ctx, &mut Ping::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), "protocol error: invalid envelope flags 128");
    }

    #[tokio::test]
    async fn test_malformed_end_stream() {
        let ctx = CallContext::background();
        let frame = wrap_envelope(FLAG_END_STREAM, b"not json").unwrap();
        let mut unmarshaler = ConnectStreamingUnmarshaler::new(EnvelopeReader::new(&frame[..]), json());
        let err = unmarshaler
            .unmarshal(&ctx, &mut Ping::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().starts_with("unmarshal end stream message: "));
    }

    #[test]
    fn test_unary_marshal_compresses_above_threshold() {
        let pool = CompressionPool::new(ReverseCompressor("rev"));
        let marshaler = ConnectUnaryMarshaler::new(json()).with_compression(Some(pool), 20);

        let mut header = HeaderMap::new();
        let small = marshaler.marshal(&ping("a"), &mut header).unwrap();
        assert_eq!(&small[..], br#"{"text":"a"}"#);
        assert!(header.get(CONTENT_ENCODING).is_none());

        let mut header = HeaderMap::new();
        let big = marshaler.marshal(&ping("abcdefghij"), &mut header).unwrap();
        assert_eq!(header[CONTENT_ENCODING], "rev");
        let unmarshaler = ConnectUnaryUnmarshaler::new(json())
            .with_compression(Some(CompressionPool::new(ReverseCompressor("rev"))));
        let mut decoded = Ping::default();
        unmarshaler.unmarshal(&big, &mut decoded).unwrap();
        assert_eq!(decoded.text, "abcdefghij");
    }

    #[test]
    fn test_unary_send_limit() {
        let marshaler = ConnectUnaryMarshaler::new(json()).with_send_max_bytes(Some(4));
        let err = marshaler
            .marshal(&ping("too long"), &mut HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(err.message().starts_with("message size "));
    }

    #[test]
    fn test_unary_read_limit() {
        let unmarshaler = ConnectUnaryUnmarshaler::new(json()).with_read_max_bytes(Some(4));
        let err = unmarshaler
            .unmarshal(br#"{"text":"x"}"#, &mut Ping::default())
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[test]
    fn test_unary_unmarshal_failure_is_invalid_argument() {
        let err = ConnectUnaryUnmarshaler::new(json())
            .unmarshal(b"{", &mut Ping::default())
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().starts_with("unmarshal message: "));
    }

    #[tokio::test]
    async fn test_unary_body_limit() {
        let ctx = CallContext::background();
        let unmarshaler = ConnectUnaryUnmarshaler::new(json()).with_read_max_bytes(Some(4));
        let err = unmarshaler
            .unmarshal_body(&ctx, Body::from(r#"{"text":"x"}"#), &mut Ping::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);

        let unmarshaler = ConnectUnaryUnmarshaler::new(json());
        let mut message = Ping::default();
        unmarshaler
            .unmarshal_body(&ctx, Body::from(r#"{"text":"x"}"#), &mut message)
            .await
            .unwrap();
        assert_eq!(message.text, "x");
    }

    #[test]
    fn test_get_url_json() {
        let base: Uri = "http://localhost/acme.v1.Svc/Get".parse().unwrap();
        let url = ConnectUnaryMarshaler::new(json())
            .get_url(&base, &ping("hi"))
            .unwrap();
        assert_eq!(url.path(), "/acme.v1.Svc/Get");
        let query = url.query().unwrap();
        assert!(query.contains("connect=v1"));
        assert!(query.contains("encoding=json"));
        assert!(!query.contains("base64"));

        let mut decoded = Ping::default();
        ConnectUnaryUnmarshaler::new(json())
            .unmarshal_query(query, &mut decoded)
            .unwrap();
        assert_eq!(decoded.text, "hi");
    }

    #[test]
    fn test_get_url_binary_uses_base64() {
        let base: Uri = "/acme.v1.Svc/Get".parse().unwrap();
        let url = ConnectUnaryMarshaler::new(proto())
            .get_url(&base, &ping("hi"))
            .unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("base64=1"));
        assert!(query.contains("encoding=proto"));

        let mut decoded = Ping::default();
        ConnectUnaryUnmarshaler::new(proto())
            .unmarshal_query(query, &mut decoded)
            .unwrap();
        assert_eq!(decoded.text, "hi");
    }

    #[test]
    fn test_get_url_send_limit() {
        let base: Uri = "/acme.v1.Svc/Get".parse().unwrap();
        let err = ConnectUnaryMarshaler::new(json())
            .with_send_max_bytes(Some(4))
            .get_url(&base, &ping("hello"))
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(err.message().ends_with("enabling request compression may help"));

        // Reversing never shrinks, so compression cannot rescue the call.
        let err = ConnectUnaryMarshaler::new(json())
            .with_compression(Some(CompressionPool::new(ReverseCompressor("rev"))), 0)
            .with_send_max_bytes(Some(16))
            .get_url(&base, &ping("long enough to overflow"))
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(err.message().starts_with("compressed message size "));
    }

    #[test]
    fn test_negotiate_unary_post() {
        let config = HandlerConfig::new(
            "/acme.v1.Svc/Get",
            StreamType::Unary,
            [HandlerOption::from(with_compression(
                "rev",
                Some(CompressionPool::new(ReverseCompressor("rev"))),
            ))],
        );
        let request = Request::post("/acme.v1.Svc/Get")
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "rev")
            .header(ACCEPT_ENCODING, "rev")
            .header(HEADER_TIMEOUT, "100")
            .body(())
            .unwrap();
        let negotiation = ConnectNegotiation::negotiate(&request, &config).unwrap();
        assert_eq!(negotiation.codec.name(), "json");
        assert_eq!(negotiation.compression.request, "rev");
        assert_eq!(negotiation.compression.response, "rev");
        assert_eq!(negotiation.timeout, Some(Duration::from_millis(100)));
        assert_eq!(negotiation.response_header[CONTENT_TYPE], "application/json");
        assert!(negotiation.response_header.get(HEADER_VARY).is_none());
    }

    #[test]
    fn test_negotiate_get() {
        let config = HandlerConfig::new("/acme.v1.Svc/Get", StreamType::Unary, []);
        let request = Request::get("/acme.v1.Svc/Get?connect=v1&encoding=json&message=%7B%7D")
            .body(())
            .unwrap();
        let negotiation = ConnectNegotiation::negotiate(&request, &config).unwrap();
        assert_eq!(negotiation.codec.name(), "json");
        assert_eq!(negotiation.response_header[HEADER_VARY], "Accept-Encoding");

        let mut message = Ping::default();
        negotiation
            .unary_unmarshaler()
            .unmarshal_query(request.uri().query().unwrap(), &mut message)
            .unwrap();
        assert_eq!(message, Ping::default());
    }

    #[test]
    fn test_negotiate_unknown_codec() {
        let config = HandlerConfig::new("/acme.v1.Svc/Get", StreamType::Unary, []);
        let request = Request::post("/acme.v1.Svc/Get")
            .header(CONTENT_TYPE, "application/xml")
            .body(())
            .unwrap();
        let err = ConnectNegotiation::negotiate(&request, &config).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_streaming_handler_conn() {
        let config = HandlerConfig::new(
            "/acme.v1.Svc/Chat",
            StreamType::BiDiStream,
            [HandlerOption::from(with_read_max_bytes(1024))],
        );
        let request = Request::post("/acme.v1.Svc/Chat")
            .header(CONTENT_TYPE, "application/connect+json")
            .body(())
            .unwrap();
        let negotiation = ConnectNegotiation::negotiate(&request, &config).unwrap();
        assert_eq!(
            negotiation.response_header[CONTENT_TYPE],
            "application/connect+json"
        );

        let ctx = CallContext::background();
        let mut body = Vec::new();
        body.extend_from_slice(&wrap_envelope(0, br#"{"text":"ping"}"#).unwrap());
        let mut conn = negotiation.streaming_conn(
            config.spec(),
            ctx,
            request.headers().clone(),
            &body[..],
            Vec::new(),
        );

        let mut message = Ping::default();
        assert!(conn.receive(&mut message).await.unwrap());
        assert_eq!(message.text, "ping");
        assert!(!conn.receive(&mut message).await.unwrap());

        conn.send(&ping("pong")).await.unwrap();
        conn.response_trailer()
            .insert("x-done", HeaderValue::from_static("yes"));
        let written = conn.close(None).await.unwrap();

        let ctx = CallContext::background();
        let mut reader = ConnectStreamingUnmarshaler::new(EnvelopeReader::new(&written[..]), json());
        let mut reply = Ping::default();
        assert_eq!(reader.unmarshal(&ctx, &mut reply).await.unwrap(), StreamRead::Message);
        assert_eq!(reply.text, "pong");
        assert_eq!(reader.unmarshal(&ctx, &mut reply).await.unwrap(), StreamRead::EndStream);
        assert_eq!(reader.trailer()["x-done"], "yes");
    }
}
