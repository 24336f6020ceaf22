//! Length-prefixed envelope framing.
//!
//! Streaming calls (and every gRPC call) carry messages as envelopes:
//!
//! ```text
//! [flags:1][length:4][payload:length]
//! ```
//!
//! The length is big-endian. Flag bits are independent: bit 0 marks a
//! compressed payload, bit 1 is the Connect end-of-stream marker. Protocols
//! give any bit besides "compressed" their own meaning, so the reader hands
//! such frames back as [`ReadOutcome::Special`] instead of interpreting them.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::compression::CompressionPool;
use crate::context::CallContext;
use crate::error::{Code, Error};

/// The payload is compressed with the stream's negotiated compression.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// The envelope ends a Connect stream.
pub const FLAG_END_STREAM: u8 = 0b0000_0010;

/// Envelope prefix size (flags + length).
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Most payload capacity reserved before any payload byte arrives.
const READ_RESERVE_BYTES: usize = 64 * 1024;

/// One framed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    pub fn new(flags: u8, data: impl Into<Bytes>) -> Self {
        Self {
            flags,
            data: data.into(),
        }
    }

    /// Whether every bit of `flag` is set.
    pub fn is_set(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

/// What [`EnvelopeReader::read`] found.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A data message, already decompressed.
    Message(PooledBuffer),
    /// A frame with flags beyond [`FLAG_COMPRESSED`]; its payload is already
    /// decompressed but its flags are untouched.
    Special(Envelope),
    /// The body ended cleanly between frames.
    Eof,
}

/// Wrap a payload in an envelope.
///
/// Frame format: `[flags:1][length:4][payload]`
pub fn wrap_envelope(flags: u8, payload: &[u8]) -> Result<Bytes, Error> {
    let length = frame_length(payload.len())?;
    let mut frame = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    frame.put_u8(flags);
    frame.put_u32(length);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Parse an envelope prefix.
///
/// Returns `(flags, length)`.
pub fn parse_envelope_header(data: &[u8]) -> Result<(u8, u32), Error> {
    if data.len() < ENVELOPE_HEADER_SIZE {
        return Err(Error::new(
            Code::InvalidArgument,
            format!(
                "protocol error: incomplete envelope: expected {} bytes, got {}",
                ENVELOPE_HEADER_SIZE,
                data.len()
            ),
        ));
    }
    let flags = data[0];
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok((flags, length))
}

fn frame_length(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| {
        Error::new(
            Code::ResourceExhausted,
            format!("message size {len} exceeds maximum envelope size {}", u32::MAX),
        )
    })
}

/// Writes envelopes to an async byte sink.
#[derive(Debug)]
pub struct EnvelopeWriter<W> {
    sender: W,
    compression: Option<CompressionPool>,
    compress_min_bytes: usize,
    send_max_bytes: Option<usize>,
}

impl<W> EnvelopeWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// A writer that never compresses and has no size limit.
    pub fn new(sender: W) -> Self {
        Self {
            sender,
            compression: None,
            compress_min_bytes: 0,
            send_max_bytes: None,
        }
    }

    /// Compress payloads of at least `min_bytes` with `pool`.
    pub fn with_compression(mut self, pool: Option<CompressionPool>, min_bytes: usize) -> Self {
        self.compression = pool;
        self.compress_min_bytes = min_bytes;
        self
    }

    /// Reject payloads larger than `max` bytes (after compression).
    pub fn with_send_max_bytes(mut self, max: Option<usize>) -> Self {
        self.send_max_bytes = max;
        self
    }

    /// The compression applied to outgoing messages, if any.
    pub fn compression(&self) -> Option<&CompressionPool> {
        self.compression.as_ref()
    }

    pub fn get_ref(&self) -> &W {
        &self.sender
    }

    pub fn into_inner(self) -> W {
        self.sender
    }

    /// Frame and write one data message, compressing it when configured.
    pub async fn marshal(&mut self, ctx: &CallContext, data: &[u8]) -> Result<(), Error> {
        let pool = match &self.compression {
            Some(pool) if data.len() >= self.compress_min_bytes => pool.clone(),
            _ => {
                self.check_send_limit(data.len(), "message")?;
                return self.write_frame(ctx, 0, data).await;
            }
        };
        let compressed = pool.compress(data)?;
        self.check_send_limit(compressed.len(), "compressed message")?;
        self.write_frame(ctx, FLAG_COMPRESSED, &compressed).await
    }

    /// Write an envelope as-is. Used for end-of-stream frames.
    pub async fn write(&mut self, ctx: &CallContext, envelope: &Envelope) -> Result<(), Error> {
        self.write_frame(ctx, envelope.flags, &envelope.data).await
    }

    fn check_send_limit(&self, size: usize, what: &str) -> Result<(), Error> {
        if let Some(max) = self.send_max_bytes
            && size > max
        {
            return Err(Error::new(
                Code::ResourceExhausted,
                format!("{what} size {size} exceeds sendMaxBytes {max}"),
            ));
        }
        Ok(())
    }

    async fn write_frame(
        &mut self,
        ctx: &CallContext,
        flags: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let length = frame_length(payload.len())?;
        let mut prefix = [0u8; ENVELOPE_HEADER_SIZE];
        prefix[0] = flags;
        prefix[1..].copy_from_slice(&length.to_be_bytes());

        let sender = &mut self.sender;
        ctx.run(async move {
            sender.write_all(&prefix).await?;
            sender.write_all(payload).await?;
            sender.flush().await
        })
        .await??;
        Ok(())
    }
}

/// Reads envelopes from an async byte source.
#[derive(Debug)]
pub struct EnvelopeReader<R> {
    reader: R,
    compression: Option<CompressionPool>,
    read_max_bytes: Option<usize>,
    buffers: BufferPool,
}

impl<R> EnvelopeReader<R>
where
    R: AsyncRead + Unpin,
{
    /// A reader without decompression or size limit.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            compression: None,
            read_max_bytes: None,
            buffers: BufferPool::global().clone(),
        }
    }

    /// Decompress compressed frames with `pool`.
    pub fn with_compression(mut self, pool: Option<CompressionPool>) -> Self {
        self.compression = pool;
        self
    }

    /// Reject messages larger than `max` bytes, before and after
    /// decompression.
    pub fn with_read_max_bytes(mut self, max: Option<usize>) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Stage payloads in buffers from `buffers`.
    pub fn with_buffer_pool(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame.
    pub async fn read(&mut self, ctx: &CallContext) -> Result<ReadOutcome, Error> {
        let mut prefix = [0u8; ENVELOPE_HEADER_SIZE];
        let filled = ctx.run(read_full(&mut self.reader, &mut prefix)).await??;
        if filled == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if filled < ENVELOPE_HEADER_SIZE {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "protocol error: incomplete envelope: got {filled} of {ENVELOPE_HEADER_SIZE} prefix bytes"
                ),
            ));
        }
        let (flags, size) = parse_envelope_header(&prefix)?;
        let size = size as usize;

        if let Some(max) = self.read_max_bytes
            && size > max
        {
            // Skip the payload so the next read starts on a frame boundary.
            let reader = &mut self.reader;
            let discarded = ctx
                .run(async move {
                    tokio::io::copy(&mut reader.take(size as u64), &mut tokio::io::sink()).await
                })
                .await??;
            tracing::debug!(size, max, discarded, "discarded oversized envelope");
            return Err(Error::new(
                Code::ResourceExhausted,
                format!("message size {size} is larger than configured max {max}"),
            ));
        }

        // The declared length is untrusted; grow only with bytes received.
        let mut payload = self.buffers.get();
        payload.reserve(size.min(READ_RESERVE_BYTES));
        let reader = &mut self.reader;
        let buf: &mut BytesMut = &mut payload;
        let got = ctx
            .run(async move {
                let mut limited = reader.take(size as u64);
                while limited.read_buf(buf).await? != 0 {}
                Ok::<_, std::io::Error>(buf.len())
            })
            .await??;
        if got < size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!("protocol error: promised {size} bytes in enveloped message, got {got} bytes"),
            ));
        }

        if size > 0 && flags & FLAG_COMPRESSED != 0 {
            let Some(pool) = &self.compression else {
                return Err(Error::new(
                    Code::Internal,
                    "protocol error: sent compressed message without compression support",
                ));
            };
            payload = pool.decompress(&payload, self.read_max_bytes)?;
        }

        if flags & !FLAG_COMPRESSED != 0 {
            let data = Bytes::copy_from_slice(&payload);
            return Ok(ReadOutcome::Special(Envelope { flags, data }));
        }
        Ok(ReadOutcome::Message(payload))
    }
}

/// Fill `buf` unless the source ends first; returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
