//! Write Buffer
//!
//! [`Buffer`] turns many small row writes into a few large bulk inserts.
//! Rows pass through three tiers:
//!
//! ```text
//! push(row)
//!     ↓
//! rows (memory)           ← JSON lines, in push order
//!     ↓ len >= max_rows_in_memory, or timer tick
//! write_segments()        ← staged to disk, optionally compressed
//!     ↓
//! files (disk)            ← oldest first
//!     ↓ conditions met (age / staged rows)
//! load()                  ← serialized by the load mutex, retried
//!     ↓ acknowledged
//! segment files deleted
//! ```
//!
//! ## Accounting
//!
//! A staged file is either queued in `files` or claimed by a load
//! (`in_flight`). The staged row counter covers both, and is only
//! decremented once the server acknowledged the load. A failed load puts
//! its files back at the front of the queue, so nothing is dropped and
//! the next trigger retries them (at-least-once).
//!
//! ## Background Work
//!
//! Staging and loads triggered by `push` or the timer run as spawned
//! tasks. Their failures are logged and published on
//! [`Buffer::subscribe_errors`]; [`Buffer::settle`] waits for them.
//!
//! ## Usage
//!
//! ```ignore
//! let directory = Buffer::prepare_directory("/var/lib/buffer", "default", "events", 0o755).await?;
//! let client = Arc::new(HttpClient::new(ClientConfig::default())?);
//! let buffer = Buffer::new(BufferConfig::new("events", directory), client)?;
//!
//! // Load whatever a previous process left behind
//! buffer.load_files_to_database().await?;
//!
//! buffer.push(row![1, "signup", true]).await?;
//!
//! // On shutdown: stage what is left; it is loaded on next start
//! buffer.release().await?;
//! ```

use crate::client::{InsertRequest, StoreClient};
use crate::config::BufferConfig;
use crate::error::{Error, Result};
use crate::multiplexer::load_stream;
use crate::mutex::BinaryMutex;
use crate::retry::retry_with_backoff_if;
use crate::row::{format_row, Row};
use crate::segment::{rows_in_file, rows_in_files, write_segments, SegmentName, StagedSegments};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;

/// Get current timestamp in milliseconds
fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Which background step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Staging,
    Load,
}

/// Failure of a staging or load task nobody was awaiting.
#[derive(Debug, Clone)]
pub struct BackgroundError {
    pub operation: Operation,
    pub message: String,
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<String>,
    files: VecDeque<String>,
    files_rows: usize,
    in_flight: HashSet<String>,
    in_flight_rows: usize,
    last_load_ms: i64,
}

impl State {
    fn claim(&mut self, names: &[String]) {
        let queued: HashSet<&String> = names.iter().collect();
        let before = self.files.len();
        let mut released_rows = 0;
        self.files.retain(|f| {
            if queued.contains(f) {
                released_rows += rows_in_file(f);
                false
            } else {
                true
            }
        });
        if self.files.len() != before {
            self.files_rows = self.files_rows.saturating_sub(released_rows);
        }
        for name in names {
            if self.in_flight.insert(name.clone()) {
                self.in_flight_rows += rows_in_file(name);
            }
        }
    }

    fn settle(&mut self, names: &[String]) -> usize {
        let mut rows = 0;
        for name in names {
            if self.in_flight.remove(name) {
                rows += rows_in_file(name);
            }
        }
        self.in_flight_rows = self.in_flight_rows.saturating_sub(rows);
        rows
    }

    fn requeue(&mut self, names: &[String]) {
        let rows = self.settle(names);
        for name in names.iter().rev() {
            self.files.push_front(name.clone());
        }
        self.files_rows += rows;
    }
}

struct Inner {
    config: BufferConfig,
    statement: String,
    state: Mutex<State>,
    load_lock: BinaryMutex,
    client: Arc<dyn StoreClient>,
    tasks: TaskTracker,
    errors: broadcast::Sender<BackgroundError>,
    /// Set by the first `release()`; pushes and timer ticks stop.
    closing: AtomicBool,
    /// Set once a `release()` completed.
    released: AtomicBool,
    release_lock: Mutex<()>,
    settle_lock: Mutex<()>,
}

/// Disk-staged write buffer for one table.
///
/// Must be created inside a Tokio runtime. The staging directory must not
/// be shared with another buffer.
pub struct Buffer {
    inner: Arc<Inner>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Buffer {
    pub fn new(config: BufferConfig, client: Arc<dyn StoreClient>) -> Result<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("Buffer must be created inside a Tokio runtime".to_string()))?;

        let statement = config.insert_statement();
        let (errors, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            statement,
            state: Mutex::new(State {
                last_load_ms: now_ms(),
                ..Default::default()
            }),
            load_lock: BinaryMutex::new(),
            client,
            tasks: TaskTracker::new(),
            errors,
            closing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            release_lock: Mutex::new(()),
            settle_lock: Mutex::new(()),
            config,
        });

        let timer = inner
            .config
            .conditions
            .max_age_ms
            .map(|ms| spawn_timer(Arc::downgrade(&inner), Duration::from_millis(ms)));

        tracing::info!(
            namespace = %inner.config.namespace,
            table = %inner.config.table,
            directory = ?inner.config.directory,
            max_rows_in_memory = inner.config.max_rows_in_memory,
            max_age_ms = ?inner.config.conditions.max_age_ms,
            max_rows = ?inner.config.conditions.max_rows,
            "Buffer created"
        );

        Ok(Self {
            inner,
            timer: std::sync::Mutex::new(timer),
        })
    }

    /// Create `<root>/<namespace>/<table>` with the given mode bits.
    pub async fn prepare_directory(
        root: impl AsRef<Path>,
        namespace: &str,
        table: &str,
        mode: u32,
    ) -> Result<PathBuf> {
        let directory = root.as_ref().join(namespace).join(table);
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(&directory).await?;
        Ok(directory)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// The INSERT statement every load runs.
    pub fn insert_statement(&self) -> &str {
        &self.inner.statement
    }

    /// Normalize and buffer one row.
    ///
    /// Reaching `max_rows_in_memory` detaches the whole in-memory batch and
    /// stages it in the background.
    #[tracing::instrument(level = "trace", skip(self, row), fields(table = %self.inner.config.table))]
    pub async fn push(&self, row: Row) -> Result<()> {
        let line = format_row(&row)?;
        let mut state = self.inner.state.lock().await;
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        state.rows.push(line);
        if state.rows.len() >= self.inner.config.max_rows_in_memory {
            let rows = std::mem::take(&mut state.rows);
            let check = self.inner.config.conditions.max_rows.is_some();
            // Spawned under the lock so a concurrent release() waits for it.
            self.inner.spawn_flush(rows, check);
        }
        Ok(())
    }

    /// Stage everything in memory now and wait for it, evaluating the load
    /// conditions afterwards. Staging errors are returned to the caller.
    pub async fn flush(&self) -> Result<StagedSegments> {
        let rows = self.inner.take_rows().await;
        self.inner.flush_rows(rows, true).await
    }

    /// Load up to `max_files_per_load` staged files now, regardless of the
    /// conditions. Returns the number of files committed.
    pub async fn load(&self) -> Result<usize> {
        let files = {
            let mut state = self.inner.state.lock().await;
            self.inner.take_files(&mut state)
        };
        match files {
            Some(files) => {
                let count = files.len();
                self.inner.load(files).await?;
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Load every segment file present in the staging directory, including
    /// files left behind by a previous process.
    ///
    /// Files already claimed by a running load are skipped. Files are loaded
    /// oldest first in batches of `max_files_per_load`; the first failing
    /// batch stops recovery and its error is returned.
    pub async fn load_files_to_database(&self) -> Result<usize> {
        let inner = &self.inner;
        let snapshot: HashSet<String> = list_segment_files(&inner.config.directory)
            .await?
            .into_iter()
            .collect();
        let mut loaded = 0;

        loop {
            let guard = inner.load_lock.acquire().await;

            // Deletions only happen under the load lock, so this listing is stable.
            let batch: Vec<String> = {
                let listed = list_segment_files(&inner.config.directory).await?;
                let mut state = inner.state.lock().await;
                let batch: Vec<String> = listed
                    .into_iter()
                    .filter(|f| snapshot.contains(f) && !state.in_flight.contains(f))
                    .take(inner.config.max_files_per_load)
                    .collect();
                state.claim(&batch);
                batch
            };

            if batch.is_empty() {
                break;
            }

            tracing::info!(
                table = %inner.config.table,
                files = batch.len(),
                rows = rows_in_files(&batch),
                "Recovering staged segment files"
            );
            let count = batch.len();
            inner.load_locked(batch).await?;
            loaded += count;
            drop(guard);
        }

        Ok(loaded)
    }

    /// Stop accepting rows, wait for background staging and loads, stage
    /// the rows still in memory and close the client.
    ///
    /// No final load is attempted; staged files wait for the next
    /// [`Buffer::load_files_to_database`]. Once it succeeded, further calls
    /// are no-ops. After a failure pushes stay rejected and `release` can
    /// be called again.
    pub async fn release(&self) -> Result<()> {
        let _serial = self.inner.release_lock.lock().await;
        if self.inner.released.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            // Under the state lock so no push lands after the final take.
            let _state = self.inner.state.lock().await;
            self.inner.closing.store(true, Ordering::Release);
        }
        self.stop_timer();

        // Rows detached by earlier pushes are only safe once staged.
        self.settle().await;

        let rows = self.inner.take_rows().await;
        let staged = self.inner.flush_rows(rows, false).await?;
        self.inner.client.close().await?;
        self.inner.released.store(true, Ordering::Release);

        tracing::info!(
            table = %self.inner.config.table,
            staged_rows = staged.rows,
            "Buffer released"
        );
        Ok(())
    }

    /// Wait until every background staging and load task spawned so far
    /// has finished, including loads those tasks spawn. Concurrent callers
    /// take turns.
    pub async fn settle(&self) {
        let _serial = self.inner.settle_lock.lock().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Receive failures of background staging and loads.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<BackgroundError> {
        self.inner.errors.subscribe()
    }

    pub async fn rows_in_memory(&self) -> usize {
        self.inner.state.lock().await.rows.len()
    }

    /// Staged files waiting for a load.
    pub async fn files_in_memory(&self) -> usize {
        self.inner.state.lock().await.files.len()
    }

    /// Staged files currently claimed by a load.
    pub async fn files_in_flight(&self) -> usize {
        self.inner.state.lock().await.in_flight.len()
    }

    /// Rows staged on disk and not yet acknowledged by the server.
    pub async fn rows_in_files(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.files_rows + state.in_flight_rows
    }

    fn stop_timer(&self) {
        let handle = match self.timer.lock() {
            Ok(mut timer) => timer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl Inner {
    async fn take_rows(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().await.rows)
    }

    /// Claim the oldest `max_files_per_load` queued files.
    fn take_files(&self, state: &mut State) -> Option<Vec<String>> {
        if state.files.is_empty() {
            return None;
        }
        let count = state.files.len().min(self.config.max_files_per_load);
        let batch: Vec<String> = state.files.iter().take(count).cloned().collect();
        state.claim(&batch);
        Some(batch)
    }

    fn take_files_if_due(&self, state: &mut State) -> Option<Vec<String>> {
        if !self
            .config
            .conditions
            .is_met(now_ms(), state.last_load_ms, state.files_rows)
        {
            return None;
        }
        let files = self.take_files(state)?;
        tracing::debug!(
            table = %self.config.table,
            files = files.len(),
            queued = state.files.len(),
            "Load conditions met, promoting staged files"
        );
        Some(files)
    }

    fn spawn_flush(self: &Arc<Self>, rows: Vec<String>, check_conditions: bool) {
        let inner = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = inner.flush_rows(rows, check_conditions).await {
                inner.report(Operation::Staging, &e);
            }
        });
    }

    fn spawn_load(self: &Arc<Self>, files: Vec<String>) {
        let inner = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = inner.load(files).await {
                inner.report(Operation::Load, &e);
            }
        });
    }

    fn report(&self, operation: Operation, error: &Error) {
        tracing::error!(
            namespace = %self.config.namespace,
            table = %self.config.table,
            operation = ?operation,
            error = %error,
            "Background operation failed"
        );
        let _ = self.errors.send(BackgroundError {
            operation,
            message: error.to_string(),
        });
    }

    /// Stage `rows` and queue the resulting files. On failure the rows go
    /// back to the front of the in-memory list.
    async fn flush_rows(
        self: &Arc<Self>,
        rows: Vec<String>,
        check_conditions: bool,
    ) -> Result<StagedSegments> {
        if rows.is_empty() {
            return Ok(StagedSegments::default());
        }

        let staged = match write_segments(&rows, &self.config.segment_options()).await {
            Ok(staged) => staged,
            Err(e) => {
                let mut state = self.state.lock().await;
                let newer = std::mem::replace(&mut state.rows, rows);
                state.rows.extend(newer);
                return Err(e);
            }
        };

        let promoted = {
            let mut state = self.state.lock().await;
            state.files.extend(staged.files.iter().cloned());
            state.files_rows += staged.rows;
            if check_conditions {
                self.take_files_if_due(&mut state)
            } else {
                None
            }
        };

        tracing::info!(
            table = %self.config.table,
            files = staged.files.len(),
            rows = staged.rows,
            "Rows staged"
        );

        if let Some(files) = promoted {
            self.spawn_load(files);
        }
        Ok(staged)
    }

    async fn on_timer(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let rows = std::mem::take(&mut state.rows);
        if !rows.is_empty() {
            self.spawn_flush(rows, true);
        } else if let Some(files) = self.take_files_if_due(&mut state) {
            self.spawn_load(files);
        }
    }

    async fn load(&self, files: Vec<String>) -> Result<()> {
        let _guard = self.load_lock.acquire().await;
        self.load_locked(files).await
    }

    /// Insert `files` (already claimed) and delete them once acknowledged.
    /// Caller holds the load lock.
    async fn load_locked(&self, files: Vec<String>) -> Result<()> {
        let paths: Vec<PathBuf> = files
            .iter()
            .map(|f| self.config.directory.join(f))
            .collect();
        let compression = self.config.load_compression;

        let result = retry_with_backoff_if(&self.config.retry, Error::is_transient, || {
            let client = self.client.clone();
            let request = InsertRequest {
                query: self.statement.clone(),
                data: load_stream(paths.clone(), compression),
                compression,
            };
            async move { client.insert(request).await }
        })
        .await;

        if let Err(e) = result {
            self.state.lock().await.requeue(&files);
            return Err(e);
        }

        remove_files(&paths).await;

        let rows = {
            let mut state = self.state.lock().await;
            state.last_load_ms = now_ms();
            state.settle(&files)
        };

        tracing::info!(
            namespace = %self.config.namespace,
            table = %self.config.table,
            files = files.len(),
            rows,
            "Segments loaded"
        );
        Ok(())
    }
}

fn spawn_timer(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(buffer) = inner.upgrade() else {
                break;
            };
            buffer.on_timer().await;
        }
    })
}

/// Segment files in `directory`, oldest first. Dot-prefixed temporaries
/// and non-files are skipped.
async fn list_segment_files(directory: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort_by_cached_key(|name| staging_order(name));
    Ok(names)
}

/// Sort key for segment names: staging call first, then numeric part
/// index, so `_p10_` follows `_p9_`. Unparseable names sort by name.
fn staging_order(name: &str) -> (String, usize, String) {
    match name.parse::<SegmentName>() {
        Ok(segment) => (segment.sort_key, segment.part, name.to_string()),
        Err(_) => (name.to_string(), 0, name.to_string()),
    }
}

/// Best effort: the data is already committed, a leftover file is only
/// reloaded (duplicated) by a later recovery.
async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Failed to remove loaded segment file");
            }
        }
    }
}
