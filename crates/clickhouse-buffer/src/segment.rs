//! Segment Files
//!
//! A segment is an immutable batch of newline-delimited JSON rows staged on
//! local disk until it is loaded into ClickHouse. Everything the buffer
//! needs to know about a segment is encoded in its filename, so the staging
//! directory alone is enough to recover after a crash.
//!
//! ## Filename Format
//!
//! ```text
//! 1700000000_0012345678_p0_r1000_b48890.br
//! └───┬────┘ └───┬────┘ └┬┘ └─┬─┘ └──┬─┘ └┬┘
//!  unix secs  hi-res    part rows  bytes codec (optional)
//!  └──── sort key ────┘
//! ```
//!
//! - **sort key**: shared by every part of one staging call; lexical order
//!   follows staging order within a process
//! - **rows**: number of newline-delimited rows in the file before compression
//! - **bytes**: summed length of the serialized rows, separators excluded
//!
//! ## Write Flow
//!
//! ```text
//! rows ─► chunks of max_rows_per_file ─► join "\n" ─► encode? ─► .tmp file ─► rename
//! ```
//!
//! Parts are written to a dot-prefixed temporary name and renamed into
//! place once synced, so a partially written segment is never visible
//! under a loadable name.

use crate::compression::{encode_bytes, CompressionFormat};
use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

const COUNTER_MODULUS: u64 = 10_000_000_000;

/// Parsed segment filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub sort_key: String,
    pub part: usize,
    pub rows: usize,
    pub bytes: usize,
    pub compression: Option<CompressionFormat>,
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_p{}_r{}_b{}",
            self.sort_key, self.part, self.rows, self.bytes
        )?;
        if let Some(compression) = self.compression {
            write!(f, ".{}", compression)?;
        }
        Ok(())
    }
}

impl FromStr for SegmentName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid segment filename: {}", name));

        let (stem, compression) = match name.split_once('.') {
            Some((stem, suffix)) => (stem, Some(suffix.parse::<CompressionFormat>()?)),
            None => (name, None),
        };

        let mut fields = stem.rsplitn(4, '_');
        let bytes = tagged_number(fields.next(), 'b').ok_or_else(invalid)?;
        let rows = tagged_number(fields.next(), 'r').ok_or_else(invalid)?;
        let part = tagged_number(fields.next(), 'p').ok_or_else(invalid)?;
        let sort_key = fields.next().filter(|k| !k.is_empty()).ok_or_else(invalid)?;

        Ok(SegmentName {
            sort_key: sort_key.to_string(),
            part,
            rows,
            bytes,
            compression,
        })
    }
}

fn tagged_number(field: Option<&str>, tag: char) -> Option<usize> {
    let digits = field?.strip_prefix(tag)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sum the row counts embedded in segment filenames.
///
/// Looks for an `r<digits>` token among the `_`-separated fields before the
/// first `.`; a name without one contributes nothing.
pub fn rows_in_files<I, S>(names: I) -> usize
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| rows_in_file(name.as_ref()))
        .sum()
}

pub(crate) fn rows_in_file(name: &str) -> usize {
    let stem = name.split('.').next().unwrap_or_default();
    stem.split('_')
        .find_map(|field| tagged_number(Some(field), 'r'))
        .unwrap_or(0)
}

/// New sort key: `<unix seconds>_<10-digit high-resolution counter>`.
///
/// The counter is strictly increasing within the process, so two staging
/// calls in the same second never share a key.
pub fn sort_key() -> String {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let nanos = ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let mut last = LAST.load(Ordering::Relaxed);
    let ticket = loop {
        let next = nanos.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(current) => last = current,
        }
    };

    format!("{}_{:010}", secs, ticket % COUNTER_MODULUS)
}

/// Where and how segment files are written.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub directory: PathBuf,
    pub max_rows_per_file: usize,
    pub permission_mode: u32,
    pub compression: Option<CompressionFormat>,
}

/// Outcome of one staging call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedSegments {
    /// Created filenames, in part order.
    pub files: Vec<String>,
    /// Total rows written across all parts.
    pub rows: usize,
}

/// Split `rows` into segment files of at most `max_rows_per_file` rows.
///
/// Each row must already be a single-line serialized row. On failure every
/// part written by this call is removed again before the error is returned,
/// so the caller still owns all of `rows`.
#[tracing::instrument(skip(rows, options), fields(rows = rows.len(), dir = ?options.directory))]
pub async fn write_segments(rows: &[String], options: &SegmentOptions) -> Result<StagedSegments> {
    if rows.is_empty() {
        return Ok(StagedSegments::default());
    }

    let key = sort_key();
    let mut staged = StagedSegments::default();

    for (part, chunk) in rows.chunks(options.max_rows_per_file.max(1)).enumerate() {
        let bytes = chunk.iter().map(String::len).sum();
        let mut payload = chunk.join("\n").into_bytes();
        payload.push(b'\n');

        let name = SegmentName {
            sort_key: key.clone(),
            part,
            rows: chunk.len(),
            bytes,
            compression: options.compression,
        }
        .to_string();

        if let Err(e) = write_part(&options.directory, &name, payload, options).await {
            remove_parts(&options.directory, &staged.files).await;
            return Err(Error::Staging(e));
        }

        staged.rows += chunk.len();
        staged.files.push(name);
    }

    tracing::debug!(
        files = staged.files.len(),
        rows = staged.rows,
        sort_key = %key,
        "Rows staged to segment files"
    );

    Ok(staged)
}

async fn write_part(
    directory: &Path,
    name: &str,
    payload: Vec<u8>,
    options: &SegmentOptions,
) -> std::io::Result<()> {
    let data = encode_bytes(payload, options.compression).await?;

    let tmp_path = directory.join(format!(".{}.tmp", name));
    let mut open = OpenOptions::new();
    open.write(true).create(true).truncate(true);
    #[cfg(unix)]
    open.mode(options.permission_mode);

    let result = async {
        let mut file = open.open(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        tokio::fs::rename(&tmp_path, directory.join(name)).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn remove_parts(directory: &Path, names: &[String]) {
    for name in names {
        if let Err(e) = tokio::fs::remove_file(directory.join(name)).await {
            tracing::warn!(file = %name, error = %e, "Failed to remove partial staging output");
        }
    }
}
