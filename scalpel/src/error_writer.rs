//! Writing RPC errors outside of a handler.
//!
//! [`ErrorWriter`] lets HTTP middleware (authentication, rate limiting, ...)
//! reject a request with an error the RPC client understands, in whichever
//! protocol the request speaks.

use std::convert::Infallible;

use axum::body::Body;
use bytes::Bytes;
use futures::stream;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use scalpel_core::Error;

use crate::config::HandlerConfig;
use crate::options::HandlerOption;
use crate::protocol::{HEADER_TRAILER, ProtocolType, connect, grpc, request_content_type};
use crate::spec::StreamType;

/// Writes errors in the format of the request's RPC protocol.
///
/// Immutable once built; share it freely.
///
/// ```ignore
/// let writer = ErrorWriter::new([]);
/// if writer.is_supported(&request) {
///     let mut response = Response::new(Body::empty());
///     writer.write(&mut response, &request, &Error::unauthenticated("no token"))?;
///     return Ok(response);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ErrorWriter {
    require_connect_protocol_header: bool,
}

impl ErrorWriter {
    /// Build a writer from handler options.
    ///
    /// The writer serves no particular procedure, so conditional options
    /// never apply.
    pub fn new(options: impl IntoIterator<Item = HandlerOption>) -> Self {
        let config = HandlerConfig::new("", StreamType::Unary, options);
        Self {
            require_connect_protocol_header: config.require_connect_protocol_header(),
        }
    }

    pub fn classify<B>(&self, request: &Request<B>) -> ProtocolType {
        ProtocolType::classify(request, self.require_connect_protocol_header)
    }

    /// Whether the request speaks a protocol this writer can answer in.
    pub fn is_supported<B>(&self, request: &Request<B>) -> bool {
        self.classify(request) != ProtocolType::Unknown
    }

    /// Write `error` into `response` using the request's protocol.
    ///
    /// Requests in an unknown protocol leave `response` untouched; check
    /// [`is_supported`](Self::is_supported) first. The request body is never
    /// read.
    pub fn write<B>(
        &self,
        response: &mut Response<Body>,
        request: &Request<B>,
        error: &Error,
    ) -> Result<(), Error> {
        match self.classify(request) {
            ProtocolType::Grpc => {
                echo_content_type(response, request);
                write_grpc(response, error);
                Ok(())
            }
            ProtocolType::ConnectUnary => {
                let (parts, body) = connect::unary_error_response(error)?.into_parts();
                *response.status_mut() = parts.status;
                response.headers_mut().extend(parts.headers);
                *response.body_mut() = body;
                Ok(())
            }
            ProtocolType::ConnectStream => {
                echo_content_type(response, request);
                let frame = connect::end_stream_frame(Some(error), &HeaderMap::new())?;
                *response.status_mut() = StatusCode::OK;
                *response.body_mut() = Body::from(frame);
                Ok(())
            }
            ProtocolType::Unknown => {
                tracing::debug!(
                    method = %request.method(),
                    "request is not an RPC, error not written"
                );
                Ok(())
            }
        }
    }
}

fn echo_content_type<B>(response: &mut Response<Body>, request: &Request<B>) {
    if let Ok(value) = HeaderValue::from_str(&request_content_type(request)) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
}

/// A body-less gRPC response: status 200, the outcome in trailers, and a
/// `Trailer` header naming them.
fn write_grpc(response: &mut Response<Body>, error: &Error) {
    let trailers = grpc::error_trailers(error);
    let keys: Vec<&str> = trailers.keys().map(|name| name.as_str()).collect();
    match HeaderValue::from_str(&keys.join(",")) {
        Ok(value) => {
            response.headers_mut().insert(HEADER_TRAILER, value);
        }
        Err(err) => tracing::debug!(error = %err, "trailer announcement dropped"),
    }
    *response.status_mut() = StatusCode::OK;
    let frames = stream::iter([Ok::<_, Infallible>(Frame::<Bytes>::trailers(trailers))]);
    *response.body_mut() = Body::new(StreamBody::new(frames));
}
