//! # scalpel
//!
//! The protocol layer of an RPC framework: one handler, several wire
//! protocols. A request is classified as Connect (unary or streaming) or
//! gRPC, its codec and compression are negotiated from the registries in the
//! handler's config, messages are (un)marshaled through the envelope framer,
//! and errors are translated into each protocol's wire form.
//!
//! ## Modules
//!
//! - [`spec`]: what a call looks like ([`Spec`], [`StreamType`])
//! - [`options`] and [`config`]: client and handler configuration
//! - [`protocol`]: classification plus the [`protocol::connect`] and
//!   [`protocol::grpc`] implementations
//! - [`interceptor`]: onion-style wrappers around calls
//! - [`error_writer`]: protocol-correct errors from outside a handler
//!
//! The protocol-neutral building blocks (errors, envelopes, codecs,
//! compression) live in `scalpel-core` and are re-exported here.

pub mod config;
pub mod error_writer;
pub mod interceptor;
pub mod options;
pub mod protocol;
pub mod spec;

#[cfg(test)]
pub(crate) mod testing;

pub use scalpel_core::{
    BufferPool, COMPRESSION_GZIP, COMPRESSION_IDENTITY, CallContext, CancelHandle, Code, Codec,
    CodecError, CompressionPool, Compressor, ContextError, Envelope, EnvelopeReader,
    EnvelopeWriter, Error, ErrorDetail, FLAG_COMPRESSED, FLAG_END_STREAM, Message,
    ProtoBinaryCodec, ProtoJsonCodec, ReadOnlyCodecs, ReadOnlyCompressionPools, ReadOutcome,
};

pub use config::{ClientConfig, ClientProtocol, HandlerConfig, MessageLimits};
pub use error_writer::ErrorWriter;
pub use interceptor::{
    AnyRequest, AnyResponse, Chain, FnInterceptor, HeaderInterceptor, Interceptor,
    StreamingClientConn, StreamingHandlerConn, UnaryFunc, UnaryInterceptorFunc, chain,
};
pub use options::{ClientOption, HandlerOption, SharedOption};
pub use protocol::ProtocolType;
pub use spec::{IdempotencyLevel, Spec, StreamType};

// Re-export several crates
pub use bytes;
pub use http;
pub use prost;
pub use scalpel_core;

pub mod prelude {
    //! The types most handlers and clients need.
    pub use crate::error_writer::ErrorWriter;
    pub use crate::options::*;
    pub use crate::{
        CallContext, ClientConfig, Code, Error, ErrorDetail, HandlerConfig, Interceptor, Spec,
        StreamType,
    };
}
