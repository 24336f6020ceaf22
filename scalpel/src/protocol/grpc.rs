//! The gRPC protocol.
//!
//! Every message, unary or not, travels in an envelope. The outcome of the
//! call is carried only in trailers: `grpc-status`, a percent-encoded
//! `grpc-message` and a binary `google.rpc.Status` with the details.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use prost::Message as _;
use scalpel_core::{
    BufferPool, COMPRESSION_IDENTITY, CODEC_NAME_PROTO, CallContext, Code, Codec,
    CompressionPool, EnvelopeReader, EnvelopeWriter, Error, ErrorDetail, Message, ReadOutcome,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    NegotiatedCompression, decode_binary_header, encode_binary_header,
    merge_non_protocol_headers, negotiate_compression, request_content_type,
};
use crate::config::{HandlerConfig, MessageLimits};
use crate::interceptor::StreamingHandlerConn;
use crate::spec::Spec;

pub const CONTENT_TYPE_DEFAULT: &str = "application/grpc";
pub const CONTENT_TYPE_PREFIX: &str = "application/grpc+";

pub const HEADER_STATUS: HeaderName = HeaderName::from_static("grpc-status");
pub const HEADER_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
pub const HEADER_DETAILS: HeaderName = HeaderName::from_static("grpc-status-details-bin");
pub const HEADER_COMPRESSION: HeaderName = HeaderName::from_static("grpc-encoding");
pub const HEADER_ACCEPT_COMPRESSION: HeaderName =
    HeaderName::from_static("grpc-accept-encoding");
pub const HEADER_TIMEOUT: HeaderName = HeaderName::from_static("grpc-timeout");

const MAX_TIMEOUT_DIGITS: usize = 8;
const MAX_TIMEOUT_VALUE: u128 = 100_000_000;

/// `google.rpc.Status`.
#[derive(Clone, PartialEq, prost::Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// The codec named by a gRPC content type. The bare type means protobuf.
pub fn codec_for_content_type(content_type: &str) -> &str {
    if content_type == CONTENT_TYPE_DEFAULT {
        return CODEC_NAME_PROTO;
    }
    content_type
        .strip_prefix(CONTENT_TYPE_PREFIX)
        .unwrap_or(content_type)
}

/// The content type for a codec, preferring the bare type for protobuf.
pub fn content_type_for_codec(codec_name: &str) -> String {
    if codec_name == CODEC_NAME_PROTO {
        CONTENT_TYPE_DEFAULT.to_string()
    } else {
        format!("{CONTENT_TYPE_PREFIX}{codec_name}")
    }
}

// ============================================================================
// Status trailers
// ============================================================================

/// Write the outcome of a call into `trailer`.
///
/// Success is `grpc-status: 0`. A locally built error also contributes its
/// non-protocol metadata.
pub fn error_to_trailer(trailer: &mut HeaderMap, err: Option<&Error>) {
    let Some(err) = err else {
        trailer.insert(HEADER_STATUS, HeaderValue::from_static("0"));
        return;
    };
    if !err.is_wire_error() {
        merge_non_protocol_headers(trailer, err.meta());
    }

    let status = RpcStatus {
        code: err.code().as_u32() as i32,
        message: err.message().to_string(),
        details: err
            .details()
            .iter()
            .map(|detail| prost_types::Any {
                type_url: detail.type_url().to_string(),
                value: detail.value().to_vec(),
            })
            .collect(),
    };
    trailer.insert(HEADER_STATUS, HeaderValue::from(err.code().as_u32()));
    match HeaderValue::from_str(&percent_encode(err.message())) {
        Ok(message) => {
            trailer.insert(HEADER_MESSAGE, message);
        }
        Err(e) => tracing::debug!(error = %e, "grpc-message dropped"),
    }
    match HeaderValue::from_str(&encode_binary_header(&status.encode_to_vec())) {
        Ok(details) => {
            trailer.insert(HEADER_DETAILS, details);
        }
        Err(e) => tracing::debug!(error = %e, "grpc-status-details-bin dropped"),
    }
}

/// Read the outcome of a call from `trailer`. `None` means success.
///
/// When `grpc-status-details-bin` is present its code and message win over
/// the plain trailers.
pub fn error_from_trailer(trailer: &HeaderMap) -> Option<Error> {
    let status = trailer
        .get(HEADER_STATUS)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .filter(|v| !v.is_empty());
    let Some(status) = status else {
        let code = if trailer.is_empty() {
            Code::Internal
        } else {
            Code::Unknown
        };
        return Some(Error::new(
            code,
            "protocol error: no Grpc-Status trailer: unexpected EOF",
        ));
    };
    if status == "0" {
        return None;
    }
    let Ok(code) = status.parse::<u32>() else {
        return Some(Error::new(
            Code::Unknown,
            format!("protocol error: invalid error code {status:?}"),
        ));
    };
    let message = trailer
        .get(HEADER_MESSAGE)
        .map(|v| percent_decode(&String::from_utf8_lossy(v.as_bytes())))
        .unwrap_or_default();

    let details = trailer
        .get(HEADER_DETAILS)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .filter(|v| !v.is_empty());
    let Some(details) = details else {
        return Some(Error::from_wire(Code::from_u32(code), message));
    };
    let bytes = match decode_binary_header(&details) {
        Ok(bytes) => bytes,
        Err(e) => {
            return Some(Error::new(
                Code::Internal,
                format!("server returned invalid grpc-status-details-bin trailer: {e}"),
            ));
        }
    };
    let status = match RpcStatus::decode(bytes.as_slice()) {
        Ok(status) => status,
        Err(e) => {
            return Some(Error::new(
                Code::Internal,
                format!("server returned invalid protobuf for error details: {e}"),
            ));
        }
    };
    let code = u32::try_from(status.code).map_or(Code::Unknown, Code::from_u32);
    let mut err = Error::from_wire(code, status.message);
    for any in status.details {
        err.push_detail(ErrorDetail::new(any.type_url, any.value));
    }
    Some(err)
}

/// Percent-encode a `grpc-message`: bytes outside printable ASCII and `%`
/// become `%XX`.
pub fn percent_encode(message: &str) -> String {
    let needs_encoding = message
        .bytes()
        .any(|b| !(b' '..=b'~').contains(&b) || b == b'%');
    if !needs_encoding {
        return message.to_string();
    }
    let mut encoded = String::with_capacity(message.len() * 2);
    for b in message.bytes() {
        if (b' '..=b'~').contains(&b) && b != b'%' {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

/// Reverse [`percent_encode`]. Malformed escapes are kept as they are.
pub fn percent_decode(message: &str) -> String {
    if !message.contains('%') {
        return message.to_string();
    }
    let input = message.as_bytes();
    let mut decoded = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%'
            && i + 2 < input.len()
            && let (Some(hi), Some(lo)) = (hex_value(input[i + 1]), hex_value(input[i + 2]))
        {
            decoded.push((hi << 4) | lo);
            i += 3;
            continue;
        }
        decoded.push(input[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

// ============================================================================
// Timeouts
// ============================================================================

/// Parse `grpc-timeout`: up to eight digits and a unit (`n`, `u`, `m`, `S`,
/// `M` or `H`). Absent or empty means no timeout.
pub fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, Error> {
    let Some(value) = headers.get(HEADER_TIMEOUT) else {
        return Ok(None);
    };
    let value = String::from_utf8_lossy(value.as_bytes());
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || {
        Error::new(
            Code::InvalidArgument,
            format!("protocol error: invalid timeout {value:?}"),
        )
    };
    if !value.is_ascii() {
        return Err(invalid());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if digits.len() > MAX_TIMEOUT_DIGITS {
        return Err(Error::new(
            Code::InvalidArgument,
            format!("protocol error: timeout {value:?} is too long"),
        ));
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let timeout = match unit {
        "n" => Duration::from_nanos(amount),
        "u" => Duration::from_micros(amount),
        "m" => Duration::from_millis(amount),
        "S" => Duration::from_secs(amount),
        "M" => Duration::from_secs(amount * 60),
        "H" => Duration::from_secs(amount * 3600),
        _ => return Err(invalid()),
    };
    Ok(Some(timeout))
}

/// Render a timeout for `grpc-timeout` in the finest unit that fits in
/// eight digits.
pub fn encode_timeout(timeout: Duration) -> HeaderValue {
    let nanos = timeout.as_nanos();
    if nanos == 0 {
        return HeaderValue::from_static("0n");
    }
    const UNITS: [(u128, char); 5] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
    ];
    let (size, unit) = UNITS
        .into_iter()
        .find(|(size, _)| nanos < size * MAX_TIMEOUT_VALUE)
        .unwrap_or((3_600_000_000_000, 'H'));
    let value = (nanos / size).min(MAX_TIMEOUT_VALUE - 1);
    HeaderValue::from_str(&format!("{value}{unit}")).unwrap_or(HeaderValue::from_static("0n"))
}

// ============================================================================
// Marshaling
// ============================================================================

/// Writes gRPC messages.
#[derive(Debug)]
pub struct GrpcMarshaler<W> {
    writer: EnvelopeWriter<W>,
    codec: Arc<dyn Codec>,
    buffers: BufferPool,
}

impl<W: AsyncWrite + Unpin> GrpcMarshaler<W> {
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

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Reads gRPC messages.
#[derive(Debug)]
pub struct GrpcUnmarshaler<R> {
    reader: EnvelopeReader<R>,
    codec: Arc<dyn Codec>,
}

impl<R: AsyncRead + Unpin> GrpcUnmarshaler<R> {
    pub fn new(reader: EnvelopeReader<R>, codec: Arc<dyn Codec>) -> Self {
        Self { reader, codec }
    }

    /// Decode the next message. `Ok(false)` when the body has ended.
    pub async fn unmarshal(
        &mut self,
        ctx: &CallContext,
        message: &mut dyn Message,
    ) -> Result<bool, Error> {
        match self.reader.read(ctx).await? {
            ReadOutcome::Eof => Ok(false),
            ReadOutcome::Message(data) => {
                self.codec.unmarshal(&data, message).map_err(|err| {
                    Error::new(Code::InvalidArgument, format!("unmarshal message: {err}"))
                })?;
                Ok(true)
            }
            ReadOutcome::Special(envelope) => Err(Error::new(
                Code::Internal,
                format!("protocol error: invalid envelope flags {}", envelope.flags),
            )),
        }
    }
}

// ============================================================================
// Handler side
// ============================================================================

/// Everything a handler agreed with a gRPC client about one call.
#[derive(Clone, Debug)]
pub struct GrpcNegotiation {
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

impl GrpcNegotiation {
    /// Pick codec, compression and timeout for a gRPC request.
    pub fn negotiate<B>(request: &Request<B>, config: &HandlerConfig) -> Result<Self, Error> {
        let content_type = request_content_type(request);
        let codec_name = codec_for_content_type(&content_type);
        let codecs = config.codecs();
        let codec = codecs.get(codec_name).ok_or_else(|| {
            Error::new(
                Code::Unimplemented,
                format!(
                    "unsupported codec {codec_name:?}: supported codecs are {}",
                    codecs.names().join(",")
                ),
            )
        })?;

        let headers = request.headers();
        let header_text = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
        let pools = config.compression_pools();
        let compression = negotiate_compression(
            pools,
            header_text(HEADER_COMPRESSION),
            header_text(HEADER_ACCEPT_COMPRESSION),
        )?;
        let timeout = parse_timeout(headers)?;

        let mut response_header = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&content_type_for_codec(codec.name())) {
            response_header.insert(CONTENT_TYPE, value);
        }
        if !pools.is_empty()
            && let Ok(value) = HeaderValue::from_str(pools.comma_separated_names())
        {
            response_header.insert(HEADER_ACCEPT_COMPRESSION, value);
        }
        if compression.response != COMPRESSION_IDENTITY
            && let Ok(value) = HeaderValue::from_str(&compression.response)
        {
            response_header.insert(HEADER_COMPRESSION, value);
        }

        Ok(Self {
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

    /// The handler's end of a call over `reader` and `writer`.
    pub fn handler_conn<R, W>(
        &self,
        spec: Spec,
        ctx: CallContext,
        request_header: HeaderMap,
        reader: R,
        writer: W,
    ) -> GrpcHandlerConn<R, W>
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
        GrpcHandlerConn {
            spec,
            ctx,
            request_header,
            response_header: self.response_header.clone(),
            response_trailer: HeaderMap::new(),
            unmarshaler: GrpcUnmarshaler::new(reader, self.codec.clone()),
            marshaler: GrpcMarshaler::new(writer, self.codec.clone()),
        }
    }
}

/// The handler's end of a gRPC call.
#[derive(Debug)]
pub struct GrpcHandlerConn<R, W> {
    spec: Spec,
    ctx: CallContext,
    request_header: HeaderMap,
    response_header: HeaderMap,
    response_trailer: HeaderMap,
    unmarshaler: GrpcUnmarshaler<R>,
    marshaler: GrpcMarshaler<W>,
}

impl<R, W> GrpcHandlerConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Finish the call: returns the writer and the trailers to send, which
    /// hold the response trailers plus the status of `err`.
    pub fn close(self, err: Option<&Error>) -> (W, HeaderMap) {
        let mut trailer = self.response_trailer;
        error_to_trailer(&mut trailer, err);
        (self.marshaler.into_inner(), trailer)
    }
}

impl<R, W> StreamingHandlerConn for GrpcHandlerConn<R, W>
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
        Box::pin(async move { self.unmarshaler.unmarshal(&self.ctx, message).await })
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

/// The trailers of a call that failed before any message was exchanged.
pub fn error_trailers(err: &Error) -> HeaderMap {
    let mut trailer = HeaderMap::with_capacity(3);
    error_to_trailer(&mut trailer, Some(err));
    trailer
}
