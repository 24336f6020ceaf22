//! Compression pools and the read-only compression registry.
//!
//! This module provides:
//! - [`Compressor`]: the algorithm seam (implementations live outside this crate,
//!   apart from the optional [`GzipCompressor`])
//! - [`CompressionPool`]: a named compressor plus pooled scratch buffers
//! - [`ReadOnlyCompressionPools`]: the name → pool registry consulted during
//!   negotiation

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::BufMut;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{Code, Error};

/// The name of the "no compression" encoding.
pub const COMPRESSION_IDENTITY: &str = "identity";

/// The name of the gzip encoding.
pub const COMPRESSION_GZIP: &str = "gzip";

/// A compression algorithm.
///
/// # Example
///
/// ```ignore
/// use scalpel_core::Compressor;
///
/// struct Lz4;
///
/// impl Compressor for Lz4 {
///     fn name(&self) -> &'static str { "lz4" }
///     fn compress(&self, src: &[u8], dst: &mut bytes::BytesMut) -> std::io::Result<()> { todo!() }
///     fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn std::io::Read + 'a> { todo!() }
/// }
/// ```
pub trait Compressor: Send + Sync + 'static {
    /// The encoding name used in headers (e.g. "gzip").
    fn name(&self) -> &'static str;

    /// Compress `src`, appending the output to `dst`.
    fn compress(&self, src: &[u8], dst: &mut bytes::BytesMut) -> io::Result<()>;

    /// A reader producing the decompressed form of `src`.
    ///
    /// Returning a reader lets the pool stop reading as soon as the output
    /// exceeds the configured limit.
    fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn Read + 'a>;
}

/// A compressor paired with reusable output buffers.
///
/// Pools are cheap to clone and safe to share between calls.
#[derive(Clone)]
pub struct CompressionPool {
    compressor: Arc<dyn Compressor>,
    buffers: BufferPool,
}

impl CompressionPool {
    /// Create a pool drawing buffers from the process-wide [`BufferPool`].
    pub fn new<C: Compressor>(compressor: C) -> Self {
        Self::with_buffers(compressor, BufferPool::global().clone())
    }

    /// Create a pool drawing buffers from `buffers`.
    pub fn with_buffers<C: Compressor>(compressor: C, buffers: BufferPool) -> Self {
        Self {
            compressor: Arc::new(compressor),
            buffers,
        }
    }

    /// The encoding name.
    pub fn name(&self) -> &'static str {
        self.compressor.name()
    }

    /// Compress `src` into a pooled buffer.
    pub fn compress(&self, src: &[u8]) -> Result<PooledBuffer, Error> {
        let mut dst = self.buffers.get();
        self.compressor
            .compress(src, &mut dst)
            .map_err(|err| Error::new(Code::Internal, format!("compress: {err}")))?;
        Ok(dst)
    }

    /// Decompress `src` into a pooled buffer.
    ///
    /// When `read_max_bytes` is set, output beyond that many bytes fails the
    /// call with [`Code::ResourceExhausted`] without being buffered.
    pub fn decompress(
        &self,
        src: &[u8],
        read_max_bytes: Option<usize>,
    ) -> Result<PooledBuffer, Error> {
        let mut dst = self.buffers.get();
        let decoder = self.compressor.decoder(src);
        let mut limited: Box<dyn Read + '_> = match read_max_bytes {
            // One extra byte tells "exactly at the limit" from "over it".
            Some(max) => Box::new(decoder.take(max as u64 + 1)),
            None => decoder,
        };
        let mut writer = (&mut *dst).writer();
        let copied = io::copy(&mut limited, &mut writer)
            .map_err(|err| Error::new(Code::InvalidArgument, format!("decompress: {err}")))?;
        if let Some(max) = read_max_bytes
            && copied > max as u64
        {
            return Err(Error::new(
                Code::ResourceExhausted,
                format!("message is larger than configured max {max} bytes after decompression"),
            ));
        }
        Ok(dst)
    }
}

impl fmt::Debug for CompressionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompressionPool").field(&self.name()).finish()
    }
}

/// Order names by preference: registration order reversed, each distinct
/// name once at the position of its first registration.
pub fn preference_order<S: AsRef<str>>(registration_order: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(registration_order.len());
    let mut names: Vec<String> = registration_order
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect();
    names.reverse();
    names
}

/// Read-only view of the registered compression pools.
///
/// Built once from configuration and shared by every call afterwards.
#[derive(Clone, Debug, Default)]
pub struct ReadOnlyCompressionPools {
    name_to_pool: HashMap<String, CompressionPool>,
    names: Vec<String>,
    comma_separated_names: String,
}

impl ReadOnlyCompressionPools {
    /// Build the registry.
    ///
    /// `registration_order` lists names in the order they were registered
    /// (duplicates allowed); the last registered becomes the most preferred.
    pub fn new<S: AsRef<str>>(
        name_to_pool: HashMap<String, CompressionPool>,
        registration_order: &[S],
    ) -> Self {
        let names = preference_order(registration_order);
        let comma_separated_names = names.join(",");
        Self {
            name_to_pool,
            names,
            comma_separated_names,
        }
    }

    /// Look up a pool. Identity and the empty name never resolve to a pool.
    pub fn get(&self, name: &str) -> Option<&CompressionPool> {
        if name.is_empty() || name == COMPRESSION_IDENTITY {
            return None;
        }
        self.name_to_pool.get(name)
    }

    /// Whether a pool is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.name_to_pool.contains_key(name)
    }

    /// Registered names, most preferred first.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Registered names joined with commas, for `Accept-Encoding`-style headers.
    pub fn comma_separated_names(&self) -> &str {
        &self.comma_separated_names
    }

    /// Whether no pool is registered.
    pub fn is_empty(&self) -> bool {
        self.name_to_pool.is_empty()
    }
}

/// Gzip compression using flate2.
///
/// Requires the `gzip` feature.
#[cfg(feature = "gzip")]
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

#[cfg(feature = "gzip")]
impl Default for GzipCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

#[cfg(feature = "gzip")]
impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        COMPRESSION_GZIP
    }

    fn compress(&self, src: &[u8], dst: &mut bytes::BytesMut) -> io::Result<()> {
        use std::io::Write;

        let mut encoder =
            flate2::write::GzEncoder::new(dst.writer(), flate2::Compression::new(self.level.min(9)));
        encoder.write_all(src)?;
        encoder.finish()?;
        Ok(())
    }

    fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn Read + 'a> {
        Box::new(flate2::read::GzDecoder::new(src))
    }
}
