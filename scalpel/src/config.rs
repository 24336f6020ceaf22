//! Client and handler configuration.
//!
//! A config is assembled once from options and never changes afterwards;
//! the protocol layer reads its finished, read-only registries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use scalpel_core::{
    COMPRESSION_IDENTITY, Code, Codec, CompressionPool, Error, Message, ProtoBinaryCodec,
    ProtoJsonCodec, ReadOnlyCodecs, ReadOnlyCompressionPools,
};

use crate::interceptor::{Interceptor, chain};
use crate::options::{ClientOption, HandlerOption, SharedOption};
use crate::spec::{IdempotencyLevel, Spec, StreamType};

/// Default threshold below which messages are sent uncompressed.
pub const DEFAULT_COMPRESS_MIN_BYTES: usize = 1024;

/// Prepares a message before it is unmarshaled into.
pub type Initializer = Arc<dyn Fn(&Spec, &mut dyn Message) -> Result<(), Error> + Send + Sync>;

/// Per-message size limits.
///
/// Limits apply to each message, not to a stream as a whole. Both default to
/// unlimited.
///
/// # Example
///
/// ```rust
/// use scalpel::MessageLimits;
///
/// let limits = MessageLimits::unlimited().read_max_bytes(16 * 1024 * 1024);
/// assert_eq!(limits.read_max(), Some(16 * 1024 * 1024));
/// assert_eq!(limits.send_max(), None);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageLimits {
    read_max_bytes: Option<usize>,
    send_max_bytes: Option<usize>,
}

impl MessageLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limit received messages. Zero removes the limit.
    pub fn read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = (max > 0).then_some(max);
        self
    }

    /// Limit sent messages. Zero removes the limit.
    pub fn send_max_bytes(mut self, max: usize) -> Self {
        self.send_max_bytes = (max > 0).then_some(max);
        self
    }

    pub fn read_max(&self) -> Option<usize> {
        self.read_max_bytes
    }

    pub fn send_max(&self) -> Option<usize> {
        self.send_max_bytes
    }
}

/// Compression and codec registrations, in registration order.
#[derive(Clone, Default)]
struct Registrations {
    codecs: HashMap<String, Arc<dyn Codec>>,
    codec_names: Vec<String>,
    compression: HashMap<String, CompressionPool>,
    compression_names: Vec<String>,
}

impl Registrations {
    fn add_codec(&mut self, codec: Arc<dyn Codec>) {
        let name = codec.name();
        if name.is_empty() {
            return;
        }
        self.codec_names.push(name.to_string());
        self.codecs.insert(name.to_string(), codec);
    }

    fn set_compression(&mut self, name: String, pool: Option<CompressionPool>) {
        match pool {
            Some(pool) => {
                self.compression_names.push(name.clone());
                self.compression.insert(name, pool);
            }
            None => {
                self.compression_names.retain(|registered| *registered != name);
                self.compression.remove(&name);
            }
        }
    }

    fn with_defaults(codecs: &[Arc<dyn Codec>]) -> Self {
        let mut registrations = Self::default();
        for codec in codecs {
            registrations.add_codec(codec.clone());
        }
        #[cfg(feature = "gzip")]
        registrations.set_compression(
            scalpel_core::COMPRESSION_GZIP.to_string(),
            Some(CompressionPool::new(scalpel_core::GzipCompressor::default())),
        );
        registrations
    }

    fn read_only_codecs(&self) -> ReadOnlyCodecs {
        ReadOnlyCodecs::new(self.codecs.clone(), &self.codec_names)
    }

    fn read_only_compression_pools(&self) -> ReadOnlyCompressionPools {
        ReadOnlyCompressionPools::new(self.compression.clone(), &self.compression_names)
    }
}

/// Settings every side shares, filled in by [`SharedOption`]s.
#[derive(Clone)]
struct Common {
    procedure: String,
    stream_type: StreamType,
    schema: Option<Arc<dyn Any + Send + Sync>>,
    idempotency_level: IdempotencyLevel,
    registrations: Registrations,
    compress_min_bytes: usize,
    limits: MessageLimits,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Common {
    fn new(procedure: String, stream_type: StreamType, registrations: Registrations) -> Self {
        Self {
            procedure,
            stream_type,
            schema: None,
            idempotency_level: IdempotencyLevel::Unknown,
            registrations,
            compress_min_bytes: DEFAULT_COMPRESS_MIN_BYTES,
            limits: MessageLimits::default(),
            interceptors: Vec::new(),
        }
    }

    /// Apply an option; returns the codec it registered, if any.
    fn apply(&mut self, option: SharedOption) -> Option<Arc<dyn Codec>> {
        match option {
            SharedOption::Codec(codec) => {
                if codec.name().is_empty() {
                    return None;
                }
                self.registrations.add_codec(codec.clone());
                return Some(codec);
            }
            SharedOption::Compression { name, pool } => {
                self.registrations.set_compression(name, pool)
            }
            SharedOption::CompressMinBytes(min) => self.compress_min_bytes = min,
            SharedOption::ReadMaxBytes(max) => self.limits = self.limits.read_max_bytes(max),
            SharedOption::SendMaxBytes(max) => self.limits = self.limits.send_max_bytes(max),
            SharedOption::Schema(schema) => self.schema = Some(schema),
            SharedOption::Idempotency(level) => self.idempotency_level = level,
            SharedOption::Interceptors(interceptors) => self.interceptors.extend(interceptors),
            SharedOption::Group(options) => {
                let mut last = None;
                for option in options {
                    last = self.apply(option).or(last);
                }
                return last;
            }
        }
        None
    }

    fn spec(&self, is_client: bool) -> Spec {
        Spec {
            procedure: self.procedure.clone(),
            stream_type: self.stream_type,
            schema: self.schema.clone(),
            idempotency_level: self.idempotency_level,
            is_client,
        }
    }
}

/// A handler's configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    common: Common,
    require_connect_protocol_header: bool,
    initializer: Option<Initializer>,
    codecs: Arc<ReadOnlyCodecs>,
    compression_pools: Arc<ReadOnlyCompressionPools>,
}

impl HandlerConfig {
    /// Build a config, seeding the proto and JSON codecs before applying
    /// `options` in order.
    pub fn new(
        procedure: impl Into<String>,
        stream_type: StreamType,
        options: impl IntoIterator<Item = HandlerOption>,
    ) -> Self {
        let defaults: [Arc<dyn Codec>; 3] = [
            Arc::new(ProtoBinaryCodec),
            Arc::new(ProtoJsonCodec::new()),
            Arc::new(ProtoJsonCodec::with_charset()),
        ];
        let mut config = Self {
            common: Common::new(
                procedure.into(),
                stream_type,
                Registrations::with_defaults(&defaults),
            ),
            require_connect_protocol_header: false,
            initializer: None,
            codecs: Arc::default(),
            compression_pools: Arc::default(),
        };
        for option in options {
            config.apply(option);
        }
        config.codecs = Arc::new(config.common.registrations.read_only_codecs());
        config.compression_pools =
            Arc::new(config.common.registrations.read_only_compression_pools());
        config
    }

    fn apply(&mut self, option: HandlerOption) {
        match option {
            HandlerOption::Shared(shared) => {
                self.common.apply(shared);
            }
            HandlerOption::RequireConnectProtocolHeader(required) => {
                self.require_connect_protocol_header = required
            }
            HandlerOption::RequestInitializer(initializer) => self.initializer = Some(initializer),
            HandlerOption::Conditional(conditional) => {
                let spec = self.spec();
                if spec.procedure.is_empty() {
                    return;
                }
                for option in conditional(&spec) {
                    self.apply(option);
                }
            }
            HandlerOption::Group(options) => {
                for option in options {
                    self.apply(option);
                }
            }
        }
    }

    pub fn spec(&self) -> Spec {
        self.common.spec(false)
    }

    pub fn codecs(&self) -> &ReadOnlyCodecs {
        &self.codecs
    }

    pub fn compression_pools(&self) -> &ReadOnlyCompressionPools {
        &self.compression_pools
    }

    pub fn compress_min_bytes(&self) -> usize {
        self.common.compress_min_bytes
    }

    pub fn limits(&self) -> MessageLimits {
        self.common.limits
    }

    pub fn require_connect_protocol_header(&self) -> bool {
        self.require_connect_protocol_header
    }

    /// Run the request initializer, if one is configured.
    pub fn initialize(&self, spec: &Spec, message: &mut dyn Message) -> Result<(), Error> {
        match &self.initializer {
            Some(initializer) => initializer(spec, message),
            None => Ok(()),
        }
    }

    /// All configured interceptors as one.
    pub fn interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        chain(None, self.common.interceptors.clone())
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("procedure", &self.common.procedure)
            .field("codecs", &self.common.registrations.codec_names)
            .field("compression", &self.common.registrations.compression_names)
            .field("limits", &self.common.limits)
            .field(
                "require_connect_protocol_header",
                &self.require_connect_protocol_header,
            )
            .finish_non_exhaustive()
    }
}

/// The wire protocol a client speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProtocol {
    #[default]
    Connect,
    Grpc,
}

/// A client's configuration.
#[derive(Clone)]
pub struct ClientConfig {
    common: Common,
    protocol: ClientProtocol,
    codec: Arc<dyn Codec>,
    send_compression: Option<String>,
    http_get: bool,
    initializer: Option<Initializer>,
    compression_pools: Arc<ReadOnlyCompressionPools>,
}

impl ClientConfig {
    /// Build a config for `procedure`. Clients use binary protobuf unless a
    /// codec option says otherwise.
    ///
    /// Fails when the request compression names a compression that is not
    /// registered.
    pub fn new(
        procedure: impl Into<String>,
        stream_type: StreamType,
        options: impl IntoIterator<Item = ClientOption>,
    ) -> Result<Self, Error> {
        let codec: Arc<dyn Codec> = Arc::new(ProtoBinaryCodec);
        let mut config = Self {
            common: Common::new(
                procedure.into(),
                stream_type,
                Registrations::with_defaults(std::slice::from_ref(&codec)),
            ),
            protocol: ClientProtocol::Connect,
            codec,
            send_compression: None,
            http_get: false,
            initializer: None,
            compression_pools: Arc::default(),
        };
        for option in options {
            config.apply(option);
        }
        config.validate()?;
        config.compression_pools =
            Arc::new(config.common.registrations.read_only_compression_pools());
        Ok(config)
    }

    fn apply(&mut self, option: ClientOption) {
        match option {
            ClientOption::Shared(shared) => {
                if let Some(codec) = self.common.apply(shared) {
                    self.codec = codec;
                }
            }
            ClientOption::Grpc => self.protocol = ClientProtocol::Grpc,
            ClientOption::SendCompression(name) => self.send_compression = Some(name),
            ClientOption::HttpGet => self.http_get = true,
            ClientOption::ResponseInitializer(initializer) => self.initializer = Some(initializer),
            ClientOption::Group(options) => {
                for option in options {
                    self.apply(option);
                }
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if let Some(name) = self.send_compression.as_deref()
            && name != COMPRESSION_IDENTITY
            && !self.common.registrations.compression.contains_key(name)
        {
            return Err(Error::new(
                Code::Unknown,
                format!("unknown compression {name:?}"),
            ));
        }
        Ok(())
    }

    pub fn spec(&self) -> Spec {
        self.common.spec(true)
    }

    pub fn protocol(&self) -> ClientProtocol {
        self.protocol
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        self.codec.clone()
    }

    pub fn compression_pools(&self) -> &ReadOnlyCompressionPools {
        &self.compression_pools
    }

    /// The compression applied to requests, if any.
    pub fn send_compression(&self) -> Option<&str> {
        self.send_compression
            .as_deref()
            .filter(|name| *name != COMPRESSION_IDENTITY)
    }

    pub fn compress_min_bytes(&self) -> usize {
        self.common.compress_min_bytes
    }

    pub fn limits(&self) -> MessageLimits {
        self.common.limits
    }

    /// Whether unary calls may be sent as GET requests.
    pub fn use_http_get(&self) -> bool {
        self.http_get
            && self.protocol == ClientProtocol::Connect
            && self.common.stream_type == StreamType::Unary
            && self.common.idempotency_level == IdempotencyLevel::NoSideEffects
    }

    /// Run the response initializer, if one is configured.
    pub fn initialize(&self, spec: &Spec, message: &mut dyn Message) -> Result<(), Error> {
        match &self.initializer {
            Some(initializer) => initializer(spec, message),
            None => Ok(()),
        }
    }

    /// All configured interceptors as one.
    pub fn interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        chain(None, self.common.interceptors.clone())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("procedure", &self.common.procedure)
            .field("protocol", &self.protocol)
            .field("codec", &self.codec.name())
            .field("send_compression", &self.send_compression)
            .field("limits", &self.common.limits)
            .finish_non_exhaustive()
    }
}
