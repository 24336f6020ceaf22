//! Options for clients and handlers.
//!
//! Options are plain values applied, in order, to one mutable config while a
//! client or handler is being built. [`SharedOption`] applies to both sides;
//! [`ClientOption`] and [`HandlerOption`] add the side-specific settings.
//!
//! ```ignore
//! use scalpel::{HandlerConfig, StreamType, options::*};
//!
//! let config = HandlerConfig::new(
//!     "/acme.v1.Foo/Bar",
//!     StreamType::Unary,
//!     [
//!         with_read_max_bytes(1 << 20).into(),
//!         with_require_connect_protocol_header(true),
//!     ],
//! );
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use scalpel_core::{Codec, CompressionPool};

use crate::config::Initializer;
use crate::interceptor::Interceptor;
use crate::spec::{IdempotencyLevel, Spec};

/// Produces extra options for a procedure after inspecting its [`Spec`].
pub type ConditionalOptions = Arc<dyn Fn(&Spec) -> Vec<HandlerOption> + Send + Sync>;

/// An option valid for both clients and handlers.
#[derive(Clone)]
pub enum SharedOption {
    /// Register a codec. Codecs with an empty name are ignored.
    Codec(Arc<dyn Codec>),
    /// Register a compression pool under a name, or unregister the name.
    Compression {
        name: String,
        pool: Option<CompressionPool>,
    },
    /// Skip compressing messages smaller than this many bytes.
    CompressMinBytes(usize),
    /// Per-message limit on received bytes. Zero means unlimited.
    ReadMaxBytes(usize),
    /// Per-message limit on sent bytes. Zero means unlimited.
    SendMaxBytes(usize),
    Schema(Arc<dyn Any + Send + Sync>),
    Idempotency(IdempotencyLevel),
    /// Append interceptors to those already configured.
    Interceptors(Vec<Arc<dyn Interceptor>>),
    Group(Vec<SharedOption>),
}

/// A client-only option.
#[derive(Clone)]
pub enum ClientOption {
    Shared(SharedOption),
    /// Speak gRPC instead of Connect.
    Grpc,
    /// Compress requests with the named, registered compression.
    SendCompression(String),
    /// Send unary calls to side-effect-free procedures as GET requests.
    HttpGet,
    /// Prepare response messages before they are unmarshaled into.
    ResponseInitializer(Initializer),
    Group(Vec<ClientOption>),
}

/// A handler-only option.
#[derive(Clone)]
pub enum HandlerOption {
    Shared(SharedOption),
    /// Require `Connect-Protocol-Version` (or `connect=v1` for GET).
    RequireConnectProtocolHeader(bool),
    /// Prepare request messages before they are unmarshaled into.
    RequestInitializer(Initializer),
    /// Options chosen per procedure. Ignored when the procedure is unnamed.
    Conditional(ConditionalOptions),
    Group(Vec<HandlerOption>),
}

impl From<SharedOption> for ClientOption {
    fn from(option: SharedOption) -> Self {
        ClientOption::Shared(option)
    }
}

impl From<SharedOption> for HandlerOption {
    fn from(option: SharedOption) -> Self {
        HandlerOption::Shared(option)
    }
}

impl fmt::Debug for SharedOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(codec) => f.debug_tuple("Codec").field(&codec.name()).finish(),
            Self::Compression { name, pool } => f
                .debug_struct("Compression")
                .field("name", name)
                .field("registered", &pool.is_some())
                .finish(),
            Self::CompressMinBytes(n) => f.debug_tuple("CompressMinBytes").field(n).finish(),
            Self::ReadMaxBytes(n) => f.debug_tuple("ReadMaxBytes").field(n).finish(),
            Self::SendMaxBytes(n) => f.debug_tuple("SendMaxBytes").field(n).finish(),
            Self::Schema(_) => f.write_str("Schema(..)"),
            Self::Idempotency(level) => f.debug_tuple("Idempotency").field(level).finish(),
            Self::Interceptors(list) => f.debug_tuple("Interceptors").field(&list.len()).finish(),
            Self::Group(options) => f.debug_tuple("Group").field(options).finish(),
        }
    }
}

impl fmt::Debug for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(option) => option.fmt(f),
            Self::Grpc => f.write_str("Grpc"),
            Self::SendCompression(name) => f.debug_tuple("SendCompression").field(name).finish(),
            Self::HttpGet => f.write_str("HttpGet"),
            Self::ResponseInitializer(_) => f.write_str("ResponseInitializer(..)"),
            Self::Group(options) => f.debug_tuple("Group").field(options).finish(),
        }
    }
}

impl fmt::Debug for HandlerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(option) => option.fmt(f),
            Self::RequireConnectProtocolHeader(required) => f
                .debug_tuple("RequireConnectProtocolHeader")
                .field(required)
                .finish(),
            Self::RequestInitializer(_) => f.write_str("RequestInitializer(..)"),
            Self::Conditional(_) => f.write_str("Conditional(..)"),
            Self::Group(options) => f.debug_tuple("Group").field(options).finish(),
        }
    }
}

pub fn with_codec<C: Codec>(codec: C) -> SharedOption {
    SharedOption::Codec(Arc::new(codec))
}

pub fn with_compression(name: impl Into<String>, pool: Option<CompressionPool>) -> SharedOption {
    SharedOption::Compression {
        name: name.into(),
        pool,
    }
}

pub fn with_compress_min_bytes(min: usize) -> SharedOption {
    SharedOption::CompressMinBytes(min)
}

pub fn with_read_max_bytes(max: usize) -> SharedOption {
    SharedOption::ReadMaxBytes(max)
}

pub fn with_send_max_bytes(max: usize) -> SharedOption {
    SharedOption::SendMaxBytes(max)
}

pub fn with_schema<S: Any + Send + Sync>(schema: S) -> SharedOption {
    SharedOption::Schema(Arc::new(schema))
}

pub fn with_idempotency(level: IdempotencyLevel) -> SharedOption {
    SharedOption::Idempotency(level)
}

pub fn with_interceptors(interceptors: Vec<Arc<dyn Interceptor>>) -> SharedOption {
    SharedOption::Interceptors(interceptors)
}

pub fn with_options(options: Vec<SharedOption>) -> SharedOption {
    SharedOption::Group(options)
}

pub fn with_grpc() -> ClientOption {
    ClientOption::Grpc
}

pub fn with_send_compression(name: impl Into<String>) -> ClientOption {
    ClientOption::SendCompression(name.into())
}

pub fn with_http_get() -> ClientOption {
    ClientOption::HttpGet
}

pub fn with_response_initializer(initializer: Initializer) -> ClientOption {
    ClientOption::ResponseInitializer(initializer)
}

pub fn with_client_options(options: Vec<ClientOption>) -> ClientOption {
    ClientOption::Group(options)
}

pub fn with_require_connect_protocol_header(required: bool) -> HandlerOption {
    HandlerOption::RequireConnectProtocolHeader(required)
}

pub fn with_request_initializer(initializer: Initializer) -> HandlerOption {
    HandlerOption::RequestInitializer(initializer)
}

pub fn with_conditional_handler_options<F>(conditional: F) -> HandlerOption
where
    F: Fn(&Spec) -> Vec<HandlerOption> + Send + Sync + 'static,
{
    HandlerOption::Conditional(Arc::new(conditional))
}

pub fn with_handler_options(options: Vec<HandlerOption>) -> HandlerOption {
    HandlerOption::Group(options)
}
