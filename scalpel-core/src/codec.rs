//! Message codecs and the read-only codec registry.
//!
//! A codec turns a message into bytes for one content subtype ("proto",
//! "json", ...). Codecs work on the type-erased [`Message`] trait so a
//! single registry can serve every procedure.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::compression::preference_order;

/// Codec name for binary protobuf.
pub const CODEC_NAME_PROTO: &str = "proto";
/// Codec name for protobuf JSON.
pub const CODEC_NAME_JSON: &str = "json";
/// Codec name for protobuf JSON with an explicit charset.
pub const CODEC_NAME_JSON_CHARSET_UTF8: &str = "json; charset=utf-8";

/// Errors from encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode protobuf: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("decode protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A type-erased message that both built-in codecs can serialize.
///
/// Implemented for every prost message that also implements serde's
/// `Serialize` and `Deserialize`.
pub trait Message: Any + Send + Sync {
    fn encode_binary(&self, dst: &mut BytesMut) -> Result<(), CodecError>;
    fn merge_binary(&mut self, src: &[u8]) -> Result<(), CodecError>;
    fn encode_json(&self, dst: &mut BytesMut) -> Result<(), CodecError>;
    fn merge_json(&mut self, src: &[u8]) -> Result<(), CodecError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Message for T
where
    T: prost::Message + Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn encode_binary(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(self.encoded_len());
        prost::Message::encode(self, dst)?;
        Ok(())
    }

    fn merge_binary(&mut self, src: &[u8]) -> Result<(), CodecError> {
        prost::Message::merge(self, src)?;
        Ok(())
    }

    fn encode_json(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer(dst.writer(), self)?;
        Ok(())
    }

    fn merge_json(&mut self, src: &[u8]) -> Result<(), CodecError> {
        *self = serde_json::from_slice(src)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn Message {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    /// Downcast to a concrete message type, mutably.
    pub fn downcast_mut<M: Message>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut()
    }
}

/// Serializes messages for one content subtype.
pub trait Codec: Send + Sync + 'static {
    /// The subtype name, e.g. "proto" in `application/proto`.
    fn name(&self) -> &'static str;

    /// Whether the output is binary (and must be base64-encoded in URLs).
    fn is_binary(&self) -> bool;

    /// Append the encoding of `message` to `dst`.
    fn marshal(&self, message: &dyn Message, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode `src` into `message`.
    fn unmarshal(&self, src: &[u8], message: &mut dyn Message) -> Result<(), CodecError>;
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Codec").field(&self.name()).finish()
    }
}

/// Binary protobuf via prost.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoBinaryCodec;

impl Codec for ProtoBinaryCodec {
    fn name(&self) -> &'static str {
        CODEC_NAME_PROTO
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn marshal(&self, message: &dyn Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        message.encode_binary(dst)
    }

    fn unmarshal(&self, src: &[u8], message: &mut dyn Message) -> Result<(), CodecError> {
        message.merge_binary(src)
    }
}

/// Protobuf JSON via serde_json.
#[derive(Debug, Clone, Copy)]
pub struct ProtoJsonCodec {
    name: &'static str,
}

impl ProtoJsonCodec {
    /// The codec registered as "json".
    pub fn new() -> Self {
        Self {
            name: CODEC_NAME_JSON,
        }
    }

    /// The same codec registered as "json; charset=utf-8".
    pub fn with_charset() -> Self {
        Self {
            name: CODEC_NAME_JSON_CHARSET_UTF8,
        }
    }
}

impl Default for ProtoJsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for ProtoJsonCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn marshal(&self, message: &dyn Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        message.encode_json(dst)
    }

    fn unmarshal(&self, src: &[u8], message: &mut dyn Message) -> Result<(), CodecError> {
        // Empty bodies decode to the default message.
        if src.is_empty() {
            return message.merge_json(b"{}");
        }
        message.merge_json(src)
    }
}

/// Read-only view of the registered codecs.
#[derive(Clone, Default)]
pub struct ReadOnlyCodecs {
    name_to_codec: HashMap<String, Arc<dyn Codec>>,
    names: Vec<String>,
}

impl ReadOnlyCodecs {
    /// Build the registry.
    ///
    /// Like compression, the most recently registered name is listed first.
    pub fn new<S: AsRef<str>>(
        name_to_codec: HashMap<String, Arc<dyn Codec>>,
        registration_order: &[S],
    ) -> Self {
        Self {
            name_to_codec,
            names: preference_order(registration_order),
        }
    }

    /// Look up a codec by subtype name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.name_to_codec.get(name).cloned()
    }

    /// Whether a codec is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.name_to_codec.contains_key(name)
    }

    /// The registered protobuf codec, or the built-in one.
    pub fn protobuf(&self) -> Arc<dyn Codec> {
        self.get(CODEC_NAME_PROTO)
            .unwrap_or_else(|| Arc::new(ProtoBinaryCodec))
    }

    /// Registered names, most preferred first.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for ReadOnlyCodecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyCodecs")
            .field("names", &self.names)
            .finish()
    }
}
