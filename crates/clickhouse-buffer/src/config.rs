//! Buffer Configuration
//!
//! ## BufferConfig
//!
//! Controls how rows are held in memory, staged to segment files and
//! loaded into ClickHouse:
//!
//! - **namespace / table**: Target `"<namespace>"."<table>"` (namespace default: `default`)
//! - **directory**: Staging directory, exclusively owned by one buffer
//! - **max_rows_in_memory**: Stage once this many rows are buffered (default: 1000)
//! - **max_rows_per_file**: Rows per segment file (default: 1000)
//! - **max_files_per_load**: Segment files merged into one load (default: 100)
//! - **permission_mode**: Mode bits for segment files (default: 0o777)
//! - **conditions**: When staged segments are promoted to a load (default: every 5s)
//! - **fields**: Optional column list for the INSERT statement
//! - **segment_compression**: Codec for segment files on disk
//! - **load_compression**: Codec for the stream sent to the server
//! - **retry**: Backoff policy for loads (default: single attempt)
//!
//! ## Usage
//!
//! ```ignore
//! use clickhouse_buffer::{BufferConfig, CompressionFormat, Conditions};
//!
//! let config = BufferConfig {
//!     max_rows_in_memory: 10_000,
//!     conditions: Conditions { max_age_ms: Some(2_000), max_rows: Some(50_000) },
//!     segment_compression: Some(CompressionFormat::Brotli),
//!     load_compression: Some(CompressionFormat::Gzip),
//!     ..BufferConfig::new("events", "/var/lib/buffer/default/events")
//! };
//! ```

use crate::compression::CompressionFormat;
use crate::condition::Conditions;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::segment::SegmentOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Database the table lives in (default: "default")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Target table
    pub table: String,

    /// Staging directory for segment files
    pub directory: PathBuf,

    /// Rows held in memory before staging (default: 1000)
    #[serde(default = "default_max_rows")]
    pub max_rows_in_memory: usize,

    /// Rows per segment file (default: 1000)
    #[serde(default = "default_max_rows")]
    pub max_rows_per_file: usize,

    /// Segment files per load (default: 100)
    #[serde(default = "default_max_files_per_load")]
    pub max_files_per_load: usize,

    /// Permission bits for segment files (default: 0o777)
    #[serde(default = "default_permission_mode")]
    pub permission_mode: u32,

    /// Load promotion thresholds
    #[serde(default)]
    pub conditions: Conditions,

    /// Explicit column list for the INSERT statement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,

    /// Compression of segment files on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_compression: Option<CompressionFormat>,

    /// Compression of the load stream sent to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_compression: Option<CompressionFormat>,

    /// Retry policy wrapped around every load
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_files_per_load() -> usize {
    100
}

fn default_permission_mode() -> u32 {
    0o777
}

impl BufferConfig {
    /// Config for `table` staged under `directory`, everything else default.
    pub fn new(table: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            namespace: default_namespace(),
            table: table.into(),
            directory: directory.into(),
            max_rows_in_memory: default_max_rows(),
            max_rows_per_file: default_max_rows(),
            max_files_per_load: default_max_files_per_load(),
            permission_mode: default_permission_mode(),
            conditions: Conditions::default(),
            fields: None,
            segment_compression: None,
            load_compression: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::Config("table must not be empty".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        for (name, value) in [
            ("max_rows_in_memory", self.max_rows_in_memory),
            ("max_rows_per_file", self.max_rows_per_file),
            ("max_files_per_load", self.max_files_per_load),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.conditions.max_age_ms == Some(0) {
            return Err(Error::Config("conditions.max_age_ms must be greater than 0".to_string()));
        }
        if let Some(fields) = &self.fields {
            if fields.iter().any(|f| f.is_empty()) {
                return Err(Error::Config("fields must not contain empty names".to_string()));
            }
        }
        Ok(())
    }

    /// `INSERT INTO "<namespace>"."<table>"[ ("a","b")] FORMAT JSONCompactEachRow`
    pub fn insert_statement(&self) -> String {
        let columns = match &self.fields {
            Some(fields) => format!(
                " ({})",
                fields
                    .iter()
                    .map(|f| quote_identifier(f))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            None => String::new(),
        };
        format!(
            "INSERT INTO {}.{}{} FORMAT JSONCompactEachRow",
            quote_identifier(&self.namespace),
            quote_identifier(&self.table),
            columns
        )
    }

    pub(crate) fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            directory: self.directory.clone(),
            max_rows_per_file: self.max_rows_per_file,
            permission_mode: self.permission_mode,
            compression: self.segment_compression,
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Connection settings for [`crate::client::HttpClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the ClickHouse HTTP interface
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Default database for the session
    #[serde(default = "default_namespace")]
    pub database: String,

    /// Request timeout in milliseconds (default: 30s)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: default_user(),
            password: String::new(),
            database: default_namespace(),
            timeout_ms: default_timeout_ms(),
        }
    }
}
