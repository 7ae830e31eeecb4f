//! Shared helpers for buffer integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use clickhouse_buffer::{BufferConfig, CompressionFormat, Conditions, Error, InsertRequest, Result, StoreClient};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};

/// One insert as the server would have seen it.
#[derive(Debug, Clone)]
pub struct RecordedInsert {
    pub query: String,
    pub compression: Option<CompressionFormat>,
    pub rows: Vec<String>,
}

/// In-process store client that decodes and records every insert.
#[derive(Default)]
pub struct RecordingClient {
    inserts: Mutex<Vec<RecordedInsert>>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts with a transient load error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn inserts(&self) -> Vec<RecordedInsert> {
        self.inserts.lock().unwrap().clone()
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.lock().unwrap().len()
    }

    /// Every acknowledged row, in insert order.
    pub fn rows(&self) -> Vec<String> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .flat_map(|insert| insert.rows.clone())
            .collect()
    }

    /// Inserts attempted, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for RecordingClient {
    async fn insert(&self, request: InsertRequest) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Load("injected failure".to_string()));
        }

        let mut data = request.data;
        let mut body = Vec::new();
        data.read_to_end(&mut body).await?;

        if let Some(compression) = request.compression {
            let mut decoder = compression.decoder(BufReader::new(Cursor::new(body)));
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded).await?;
            body = decoded;
        }

        let rows = String::from_utf8_lossy(&body)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        self.inserts.lock().unwrap().push(RecordedInsert {
            query: request.query,
            compression: request.compression,
            rows,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with no automatic loads; tests opt into conditions explicitly.
pub fn manual_config(directory: &Path) -> BufferConfig {
    BufferConfig {
        conditions: Conditions::manual(),
        ..BufferConfig::new("events", directory)
    }
}

/// Loadable segment files in `directory`, sorted.
pub fn segment_files(directory: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(directory)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Poll `condition` every 20ms until it holds or 5s pass.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
