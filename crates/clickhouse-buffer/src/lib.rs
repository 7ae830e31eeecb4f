//! ClickHouse Write Buffer
//!
//! This crate turns a high rate of single-row writes into a low rate of large
//! bulk inserts, without losing rows when the server is unavailable or the
//! process restarts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ push(row)
//!        ▼
//! ┌─────────────────┐
//! │ Buffer          │
//! │ - Rows (memory) │
//! │ - Timer         │
//! └────────┬────────┘
//!          │ write_segments()
//!          ▼
//! ┌─────────────────┐
//! │ Segment files   │ ◄── staging directory, optionally compressed
//! │ <key>_p0_r5_b.. │
//! └────────┬────────┘
//!          │ load_stream()   (BinaryMutex: one load at a time)
//!          ▼
//! ┌─────────────────┐
//! │ StoreClient     │ ◄── retry_with_backoff
//! │ INSERT ... FORMAT JSONCompactEachRow
//! └────────┬────────┘
//!          │ acknowledged → segment files deleted
//!          ▼
//! ┌─────────────┐
//! │ ClickHouse  │
//! └─────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`Buffer`]: the orchestrator. Accepts rows, stages them, loads them.
//! - [`write_segments`]: partitions rows into self-describing segment files.
//! - [`load_stream`] / [`FileChain`]: concatenates segment files into one
//!   byte stream, opening each file lazily and decoding it by its suffix.
//! - [`Conditions`]: decides when staged files become a load.
//! - [`BinaryMutex`]: serializes loads across tasks.
//! - [`retry_with_backoff`]: bounded retry with clamped exponential backoff.
//! - [`HttpClient`]: streams inserts to the ClickHouse HTTP interface.
//!
//! ## Delivery Guarantee
//!
//! At-least-once. Segment files are only deleted after the server
//! acknowledged the insert; a crash between acknowledgement and deletion
//! replays those rows on the next [`Buffer::load_files_to_database`].
//!
//! ## Usage Example
//!
//! ```ignore
//! use clickhouse_buffer::{row, Buffer, BufferConfig, ClientConfig, HttpClient};
//! use std::sync::Arc;
//!
//! let directory = Buffer::prepare_directory("/var/lib/buffer", "default", "events", 0o755).await?;
//! let client = Arc::new(HttpClient::new(ClientConfig::default())?);
//! let buffer = Buffer::new(BufferConfig::new("events", directory), client)?;
//!
//! buffer.load_files_to_database().await?;
//! buffer.push(row![42, "click", chrono::Utc::now()]).await?;
//! buffer.release().await?;
//! ```

pub mod buffer;
pub mod client;
pub mod compression;
pub mod condition;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod mutex;
pub mod retry;
pub mod row;
pub mod segment;

pub use buffer::{BackgroundError, Buffer, Operation};
pub use client::{HttpClient, InsertRequest, StoreClient};
pub use compression::CompressionFormat;
pub use condition::Conditions;
pub use config::{BufferConfig, ClientConfig};
pub use error::{Error, Result};
pub use multiplexer::{load_stream, FileChain, LoadStream};
pub use mutex::{BinaryMutex, BinaryMutexGuard};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryPolicy};
pub use row::{format_row, Row, Value};
pub use segment::{rows_in_files, write_segments, SegmentName, SegmentOptions, StagedSegments};
