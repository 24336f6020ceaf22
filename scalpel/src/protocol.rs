//! Pieces shared by the Connect and gRPC protocols.
//!
//! - [`ProtocolType`]: which wire protocol a request speaks
//! - [`canonicalize_content_type`]: normalizes `Content-Type` before matching
//! - [`merge_non_protocol_headers`]: copies user metadata, never protocol headers
//! - [`negotiate_compression`]: picks request and response compression
//!
//! The protocols themselves live in [`connect`] and [`grpc`].

pub mod connect;
pub mod grpc;

use base64::Engine;
use base64::engine::DecodePaddingMode;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD_NO_PAD};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, Method, Request};
use scalpel_core::{COMPRESSION_IDENTITY, Code, Error, ReadOnlyCompressionPools};

/// Announces trailer names before a body-less response.
pub const HEADER_TRAILER: HeaderName = HeaderName::from_static("trailer");

pub(crate) const HEADER_VARY: HeaderName = HeaderName::from_static("vary");

/// Standard alphabet, padding optional on decode.
const STANDARD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// URL-safe alphabet, padding optional on decode.
pub(crate) const URL_SAFE_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The wire protocol of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolType {
    #[default]
    Unknown,
    ConnectUnary,
    ConnectStream,
    Grpc,
}

impl ProtocolType {
    /// Classify a request by method and content type.
    ///
    /// Classification only recognizes the protocol. A gRPC request naming a
    /// codec nobody registered is still gRPC, so the codec error can be
    /// reported in-protocol.
    pub fn classify<B>(request: &Request<B>, require_connect_protocol_header: bool) -> Self {
        let content_type = request_content_type(request);
        let method = request.method();
        let is_post = method == Method::POST;

        if is_post
            && (content_type == grpc::CONTENT_TYPE_DEFAULT
                || content_type.starts_with(grpc::CONTENT_TYPE_PREFIX))
        {
            return Self::Grpc;
        }
        if is_post && content_type.starts_with(connect::STREAMING_CONTENT_TYPE_PREFIX) {
            // The content type alone identifies a Connect stream.
            return match connect::check_protocol_version(request, false) {
                Ok(()) => Self::ConnectStream,
                Err(_) => Self::Unknown,
            };
        }
        if (is_post && content_type.starts_with(connect::UNARY_CONTENT_TYPE_PREFIX))
            || method == Method::GET
        {
            return match connect::check_protocol_version(request, require_connect_protocol_header) {
                Ok(()) => Self::ConnectUnary,
                Err(_) => Self::Unknown,
            };
        }
        Self::Unknown
    }
}

/// The canonical content type of a request, or "" when absent.
pub(crate) fn request_content_type<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(canonicalize_content_type)
        .unwrap_or_default()
}

/// Normalize a media type: lowercase type and parameter names, lowercase
/// `charset` values, parameters sorted and separated by `"; "`.
///
/// Values that are already canonical, such as `application/proto`, are
/// returned unchanged.
pub fn canonicalize_content_type(content_type: &str) -> String {
    let simple = content_type
        .bytes()
        .all(|b| b.is_ascii_lowercase() || matches!(b, b'.' | b'+' | b'-' | b'/'));
    if simple && content_type.bytes().filter(|b| *b == b'/').count() == 1 {
        return content_type.to_string();
    }

    let mut parts = content_type.split(';');
    let base = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let mut params: Vec<(String, String)> = Vec::new();
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            if param.trim().is_empty() {
                continue;
            }
            return content_type.to_string();
        };
        let key = key.trim().to_ascii_lowercase();
        let mut value = value.trim().trim_matches('"').to_string();
        if key == "charset" {
            value.make_ascii_lowercase();
        }
        params.push((key, value));
    }
    params.sort();

    let mut canonical = base;
    for (key, value) in params {
        canonical.push_str("; ");
        canonical.push_str(&key);
        canonical.push('=');
        canonical.push_str(&value);
    }
    canonical
}

/// Whether a header belongs to the protocol rather than to the application.
pub fn is_protocol_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        "content-type"
            | "content-length"
            | "content-encoding"
            | "accept-encoding"
            | "host"
            | "user-agent"
            | "trailer"
            | "date"
    ) || name.starts_with("connect-")
        || name.starts_with("grpc-")
        || name.starts_with("trailer-")
}

/// Append every header of `from` that is not a protocol header to `into`.
pub fn merge_non_protocol_headers(into: &mut HeaderMap, from: &HeaderMap) {
    for (name, value) in from {
        if is_protocol_header(name.as_str()) {
            continue;
        }
        into.append(name.clone(), value.clone());
    }
}

/// Names of the compressions chosen for a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCompression {
    /// How the peer compressed what it sent.
    pub request: String,
    /// How to compress what we send back.
    pub response: String,
}

/// Choose compressions from the `sent` content encoding and the `accept`
/// list of the peer.
///
/// An unregistered `sent` encoding is an error since the payload cannot be
/// read. The response uses the first accepted name that is registered,
/// skipping names marked `q=0`; without an accept list it mirrors the
/// request.
pub fn negotiate_compression(
    pools: &ReadOnlyCompressionPools,
    sent: Option<&str>,
    accept: Option<&str>,
) -> Result<NegotiatedCompression, Error> {
    let mut request = COMPRESSION_IDENTITY.to_string();
    if let Some(sent) = sent.map(str::trim)
        && !sent.is_empty()
        && sent != COMPRESSION_IDENTITY
    {
        if !pools.contains(sent) {
            return Err(Error::new(
                Code::Unimplemented,
                format!(
                    "unknown compression {sent:?}: supported encodings are {}",
                    pools.comma_separated_names()
                ),
            ));
        }
        request = sent.to_string();
    }

    let Some(accept) = accept.filter(|a| !a.trim().is_empty()) else {
        return Ok(NegotiatedCompression {
            response: request.clone(),
            request,
        });
    };

    let mut response = COMPRESSION_IDENTITY.to_string();
    for token in accept.split(',') {
        let (name, params) = match token.split_once(';') {
            Some((name, params)) => (name.trim(), Some(params)),
            None => (token.trim(), None),
        };
        let refused = params
            .into_iter()
            .flat_map(|p| p.split(';'))
            .filter_map(|p| p.trim().strip_prefix("q="))
            .any(|q| q.trim().parse::<f32>().is_ok_and(|q| q == 0.0));
        if refused || name.is_empty() {
            continue;
        }
        if pools.contains(name) {
            response = name.to_string();
            break;
        }
    }
    Ok(NegotiatedCompression { request, response })
}

/// Encode a binary header value: standard alphabet, no padding.
pub fn encode_binary_header(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

/// Decode a binary header value, with or without padding.
pub fn decode_binary_header(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_INDIFFERENT.decode(value)
}
