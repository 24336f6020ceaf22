//! Call descriptors.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The shape of an RPC: how many messages each side sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    #[default]
    Unary,
    ClientStream,
    ServerStream,
    BiDiStream,
}

impl StreamType {
    /// Whether the client sends a stream of messages.
    pub fn is_client_streaming(self) -> bool {
        matches!(self, Self::ClientStream | Self::BiDiStream)
    }

    /// Whether the server sends a stream of messages.
    pub fn is_server_streaming(self) -> bool {
        matches!(self, Self::ServerStream | Self::BiDiStream)
    }
}

/// Whether a procedure has side effects.
///
/// Procedures with no side effects may be called with Connect GET requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdempotencyLevel {
    #[default]
    Unknown,
    NoSideEffects,
    Idempotent,
}

/// Describes a call. Read-only once built.
#[derive(Clone, Default)]
pub struct Spec {
    /// Full procedure path, e.g. `/acme.foo.v1.FooService/Bar`.
    pub procedure: String,
    pub stream_type: StreamType,
    /// Schema handle supplied by generated code, if any.
    pub schema: Option<Arc<dyn Any + Send + Sync>>,
    pub idempotency_level: IdempotencyLevel,
    /// Whether the spec belongs to a client rather than a handler.
    pub is_client: bool,
}

impl Spec {
    pub fn new(procedure: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            procedure: procedure.into(),
            stream_type,
            ..Self::default()
        }
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("procedure", &self.procedure)
            .field("stream_type", &self.stream_type)
            .field("schema", &self.schema.is_some())
            .field("idempotency_level", &self.idempotency_level)
            .field("is_client", &self.is_client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_directions() {
        assert!(!StreamType::Unary.is_client_streaming());
        assert!(!StreamType::Unary.is_server_streaming());
        assert!(StreamType::ClientStream.is_client_streaming());
        assert!(!StreamType::ClientStream.is_server_streaming());
        assert!(StreamType::ServerStream.is_server_streaming());
        assert!(StreamType::BiDiStream.is_client_streaming());
        assert!(StreamType::BiDiStream.is_server_streaming());
    }
}
