//! Fixtures shared by the unit tests.

use std::io::{self, Read};

use scalpel_core::Compressor;

/// A one-field message usable with both built-in codecs.
#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
pub struct Ping {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub text: String,
}

impl prost::Name for Ping {
    const NAME: &'static str = "Ping";
    const PACKAGE: &'static str = "scalpel.test";
}

/// Reverses its input, so (de)compression is observable without a real
/// algorithm.
#[derive(Debug, Clone, Copy)]
pub struct ReverseCompressor(pub &'static str);

impl Compressor for ReverseCompressor {
    fn name(&self) -> &'static str {
        self.0
    }

    fn compress(&self, src: &[u8], dst: &mut bytes::BytesMut) -> io::Result<()> {
        dst.extend(src.iter().rev());
        Ok(())
    }

    fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn Read + 'a> {
        let reversed: Vec<u8> = src.iter().rev().copied().collect();
        Box::new(io::Cursor::new(reversed))
    }
}
