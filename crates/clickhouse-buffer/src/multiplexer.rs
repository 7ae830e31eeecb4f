//! Segment Stream Multiplexer
//!
//! Concatenates an ordered list of segment files into one continuous byte
//! stream, decompressing each file according to its filename suffix.
//!
//! ## Read Flow
//!
//! ```text
//! [seg_0.br] [seg_1] [seg_2.gzip]
//!     │         │         │
//!  Brotli    (plain)    Gzip        ← decoder picked by suffix
//!     │         │         │
//!     └────► FileChain ◄──┘          ← one file at a time, in list order
//!               │
//!       optional load encoder        ← whole-stream compression
//!               │
//!               ▼
//!          store client
//! ```
//!
//! Files are consumed strictly one after another: file N+1 is only opened
//! once file N has reported end-of-file, so at most one file is open and
//! bytes from two files never interleave. The consumer drives the pace;
//! nothing is read ahead of what the consumer asks for.

use crate::compression::CompressionFormat;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader, ReadBuf};

/// A boxed byte stream handed to the store client.
pub type LoadStream = Pin<Box<dyn AsyncRead + Send + 'static>>;

type OpenFuture = Pin<Box<dyn Future<Output = io::Result<(PathBuf, File)>> + Send>>;

/// Sequential, lazily-opened concatenation of segment files.
pub struct FileChain {
    pending: VecDeque<PathBuf>,
    opening: Option<OpenFuture>,
    current: Option<LoadStream>,
}

impl FileChain {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            pending: paths.into_iter().map(Into::into).collect(),
            opening: None,
            current: None,
        }
    }

    /// Number of files not yet opened.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    fn open_next(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(path) => {
                self.opening = Some(Box::pin(async move {
                    let file = File::open(&path).await?;
                    Ok((path, file))
                }));
                true
            }
            None => false,
        }
    }
}

fn decode_file(path: &Path, file: File) -> LoadStream {
    let reader = BufReader::new(file);
    match CompressionFormat::from_path(path) {
        Some(format) => format.decoder(reader),
        None => Box::pin(reader),
    }
}

impl AsyncRead for FileChain {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Some(current) = this.current.as_mut() {
                let before = buf.filled().len();
                ready!(current.as_mut().poll_read(cx, buf))?;
                if buf.filled().len() > before || buf.remaining() == 0 {
                    return Poll::Ready(Ok(()));
                }
                // EOF on this file
                this.current = None;
                continue;
            }

            if let Some(opening) = this.opening.as_mut() {
                let opened = ready!(opening.as_mut().poll(cx));
                this.opening = None;
                let (path, file) = opened?;
                tracing::trace!(path = ?path, "Opened segment for load stream");
                this.current = Some(decode_file(&path, file));
                continue;
            }

            if !this.open_next() {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Build the stream for one load: the decoded concatenation of `paths`,
/// re-encoded as a whole with `load_compression` when set.
pub fn load_stream<I, P>(paths: I, load_compression: Option<CompressionFormat>) -> LoadStream
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let chain = FileChain::new(paths);
    match load_compression {
        Some(format) => format.encoder(BufReader::new(chain)),
        None => Box::pin(chain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::encode_bytes;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn write_file(
        dir: &TempDir,
        name: &str,
        content: &str,
        format: Option<CompressionFormat>,
    ) -> PathBuf {
        let path = dir.path().join(name);
        let bytes = encode_bytes(content.as_bytes().to_vec(), format).await.unwrap();
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    async fn read_all(mut stream: impl AsyncRead + Unpin) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_empty_chain_is_empty_stream() {
        let chain = FileChain::new(Vec::<PathBuf>::new());
        assert_eq!(read_all(chain).await, "");
    }

    #[tokio::test]
    async fn test_concatenates_in_list_order() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "1_0_p0_r2_b6", "[1]\n[2]\n", None).await;
        let b = write_file(&dir, "1_0_p1_r1_b3", "[3]\n", None).await;
        let c = write_file(&dir, "2_0_p0_r1_b3", "[4]\n", None).await;

        let chain = FileChain::new(vec![c.clone(), a.clone(), b.clone()]);
        assert_eq!(read_all(chain).await, "[4]\n[1]\n[2]\n[3]\n");
    }

    #[tokio::test]
    async fn test_mixed_codecs_are_decoded_per_file() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "1_0_p0_r1_b4.gzip", "[10]\n", Some(CompressionFormat::Gzip)).await;
        let b = write_file(&dir, "1_0_p1_r1_b4", "[11]\n", None).await;
        let c = write_file(&dir, "1_0_p2_r1_b4.br", "[12]\n", Some(CompressionFormat::Brotli)).await;
        let d = write_file(
            &dir,
            "1_0_p3_r1_b4.deflate",
            "[13]\n",
            Some(CompressionFormat::Deflate),
        )
        .await;

        let chain = FileChain::new(vec![a, b, c, d]);
        assert_eq!(read_all(chain).await, "[10]\n[11]\n[12]\n[13]\n");
    }

    #[tokio::test]
    async fn test_next_file_opened_only_after_current_drained() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a", "first\n", None).await;
        let b = write_file(&dir, "b", "second\n", None).await;

        let mut chain = FileChain::new(vec![a, b.clone()]);
        let mut head = [0u8; 6];
        chain.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"first\n");
        assert_eq!(chain.remaining(), 1, "second file must not be opened yet");

        // The second file disappears before it is requested.
        tokio::fs::remove_file(&b).await.unwrap();
        let mut rest = Vec::new();
        let err = chain.read_to_end(&mut rest).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_load_stream_whole_stream_compression() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "1_0_p0_r1_b3.br", "[1]\n", Some(CompressionFormat::Brotli)).await;
        let b = write_file(&dir, "1_0_p1_r1_b3", "[2]\n", None).await;

        let mut stream = load_stream(vec![a, b], Some(CompressionFormat::Gzip));
        let mut encoded = Vec::new();
        stream.read_to_end(&mut encoded).await.unwrap();

        let decoded = read_all(CompressionFormat::Gzip.decoder(Cursor::new(encoded))).await;
        assert_eq!(decoded, "[1]\n[2]\n");
    }

    #[tokio::test]
    async fn test_missing_file_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let mut chain = FileChain::new(vec![dir.path().join("does_not_exist")]);
        let mut out = Vec::new();
        let err = chain.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
