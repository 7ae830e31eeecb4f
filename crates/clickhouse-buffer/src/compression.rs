//! Compression Codecs
//!
//! Segment files and load streams can each be compressed with one of the
//! HTTP content codings ClickHouse understands. The codec of a segment file
//! is recorded in its filename suffix, so the multiplexer can pick the
//! matching decoder by inspecting the name alone.
//!
//! | Format    | Tag / suffix | Wire format        |
//! |-----------|--------------|--------------------|
//! | `Gzip`    | `gzip`       | RFC 1952           |
//! | `Brotli`  | `br`         | RFC 7932           |
//! | `Deflate` | `deflate`    | zlib (RFC 1950)    |
//!
//! All codecs are streaming `tokio::io::AsyncRead` adapters from
//! `async-compression`; nothing is buffered beyond the codec window.

use crate::error::{Error, Result};
use crate::multiplexer::LoadStream;
use async_compression::tokio::bufread::{
    BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncReadExt};

/// Compression applied to segment files or to the whole load stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionFormat {
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "br", alias = "brotli")]
    Brotli,
    #[serde(rename = "deflate")]
    Deflate,
}

impl CompressionFormat {
    pub const ALL: [CompressionFormat; 3] = [
        CompressionFormat::Gzip,
        CompressionFormat::Brotli,
        CompressionFormat::Deflate,
    ];

    /// Filename suffix and `Content-Encoding` value for this codec.
    pub fn tag(&self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Brotli => "br",
            CompressionFormat::Deflate => "deflate",
        }
    }

    /// Detect the codec from a file's trailing extension.
    ///
    /// Returns `None` for files without a recognized suffix; those are
    /// passed through uncompressed.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?;
        Self::ALL.into_iter().find(|format| format.tag() == ext)
    }

    /// Wrap `reader` so that reading yields the compressed bytes.
    pub fn encoder<R>(self, reader: R) -> LoadStream
    where
        R: AsyncBufRead + Send + 'static,
    {
        match self {
            CompressionFormat::Gzip => Box::pin(GzipEncoder::new(reader)),
            CompressionFormat::Brotli => Box::pin(BrotliEncoder::new(reader)),
            CompressionFormat::Deflate => Box::pin(ZlibEncoder::new(reader)),
        }
    }

    /// Wrap `reader` so that reading yields the decompressed bytes.
    pub fn decoder<R>(self, reader: R) -> LoadStream
    where
        R: AsyncBufRead + Send + 'static,
    {
        match self {
            CompressionFormat::Gzip => {
                let mut decoder = GzipDecoder::new(reader);
                decoder.multiple_members(true);
                Box::pin(decoder)
            }
            CompressionFormat::Brotli => Box::pin(BrotliDecoder::new(reader)),
            CompressionFormat::Deflate => Box::pin(ZlibDecoder::new(reader)),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CompressionFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionFormat::Gzip),
            "br" | "brotli" => Ok(CompressionFormat::Brotli),
            "deflate" | "zlib" => Ok(CompressionFormat::Deflate),
            other => Err(Error::UnknownCompression(other.to_string())),
        }
    }
}

/// Expose an in-memory payload as a stream, optionally encoded.
///
/// This is the single-payload form of the multiplexer used on the staging
/// path: the payload is never copied into a second buffer.
pub fn encode_reader(payload: Vec<u8>, format: Option<CompressionFormat>) -> LoadStream {
    let reader = Cursor::new(payload);
    match format {
        Some(format) => format.encoder(reader),
        None => Box::pin(reader),
    }
}

/// Drain [`encode_reader`] into a buffer.
pub async fn encode_bytes(
    payload: Vec<u8>,
    format: Option<CompressionFormat>,
) -> std::io::Result<Vec<u8>> {
    if format.is_none() {
        return Ok(payload);
    }
    let mut stream = encode_reader(payload, format);
    let mut encoded = Vec::new();
    stream.read_to_end(&mut encoded).await?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        (0..500)
            .map(|i| format!("[{},\"event-{}\",1]\n", i, i % 7))
            .collect::<String>()
            .into_bytes()
    }

    #[test]
    fn test_tags_are_distinct_suffixes() {
        assert_eq!(CompressionFormat::Gzip.tag(), "gzip");
        assert_eq!(CompressionFormat::Brotli.tag(), "br");
        assert_eq!(CompressionFormat::Deflate.tag(), "deflate");
        assert_eq!(CompressionFormat::Brotli.to_string(), "br");
    }

    #[test]
    fn test_from_path_detects_suffix() {
        assert_eq!(
            CompressionFormat::from_path("1700000000_0000000042_p0_r10_b60.gzip"),
            Some(CompressionFormat::Gzip)
        );
        assert_eq!(
            CompressionFormat::from_path("/tmp/x/1_2_p1_r5_b30.br"),
            Some(CompressionFormat::Brotli)
        );
        assert_eq!(
            CompressionFormat::from_path("1_2_p0_r5_b30.deflate"),
            Some(CompressionFormat::Deflate)
        );
        assert_eq!(CompressionFormat::from_path("1_2_p0_r5_b30"), None);
        assert_eq!(CompressionFormat::from_path("1_2_p0_r5_b30.zst"), None);
    }

    #[test]
    fn test_from_str_accepts_aliases() {
        assert_eq!("GZIP".parse::<CompressionFormat>().unwrap(), CompressionFormat::Gzip);
        assert_eq!("brotli".parse::<CompressionFormat>().unwrap(), CompressionFormat::Brotli);
        assert_eq!("zlib".parse::<CompressionFormat>().unwrap(), CompressionFormat::Deflate);
        assert!(matches!(
            "lzma".parse::<CompressionFormat>(),
            Err(Error::UnknownCompression(_))
        ));
    }

    #[test]
    fn test_serde_uses_tags() {
        let json = serde_json::to_string(&CompressionFormat::Brotli).unwrap();
        assert_eq!(json, "\"br\"");
        let parsed: CompressionFormat = serde_json::from_str("\"brotli\"").unwrap();
        assert_eq!(parsed, CompressionFormat::Brotli);
    }

    #[tokio::test]
    async fn test_every_codec_roundtrips() {
        let payload = sample_payload();
        for format in CompressionFormat::ALL {
            let encoded = encode_bytes(payload.clone(), Some(format)).await.unwrap();
            assert_ne!(encoded, payload, "{} should change the bytes", format);

            let mut decoder = format.decoder(Cursor::new(encoded));
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded).await.unwrap();
            assert_eq!(decoded, payload, "{} roundtrip mismatch", format);
        }
    }

    #[tokio::test]
    async fn test_encode_without_format_is_identity() {
        let payload = sample_payload();
        let encoded = encode_bytes(payload.clone(), None).await.unwrap();
        assert_eq!(encoded, payload);
    }
}
