//! Protocol-neutral building blocks for scalpel.
//!
//! This crate provides the pieces shared by every wire protocol in the
//! `scalpel` crate.
//!
//! ## Modules
//!
//! - [`error`]: Status codes, errors and error details
//! - [`envelope`]: Length-prefixed message framing
//! - [`compression`]: Compression pools and their registry
//! - [`codec`]: Message codecs and their registry
//! - [`buffer`]: Reusable scratch buffers
//! - [`context`]: Per-call cancellation and deadlines

pub mod buffer;
pub mod codec;
pub mod compression;
pub mod context;
pub mod envelope;
pub mod error;

pub use buffer::{BufferPool, PooledBuffer};
pub use codec::{
    CODEC_NAME_JSON, CODEC_NAME_JSON_CHARSET_UTF8, CODEC_NAME_PROTO, Codec, CodecError, Message,
    ProtoBinaryCodec, ProtoJsonCodec, ReadOnlyCodecs,
};
#[cfg(feature = "gzip")]
pub use compression::GzipCompressor;
pub use compression::{
    COMPRESSION_GZIP, COMPRESSION_IDENTITY, CompressionPool, Compressor,
    ReadOnlyCompressionPools,
};
pub use context::{CallContext, CancelHandle, ContextError};
pub use envelope::{
    ENVELOPE_HEADER_SIZE, Envelope, EnvelopeReader, EnvelopeWriter, FLAG_COMPRESSED,
    FLAG_END_STREAM, ReadOutcome, parse_envelope_header, wrap_envelope,
};
pub use error::{Code, Error, ErrorDetail, ParseCodeError, ResolvedDetail};
