//! Push Rows Example
//!
//! Buffers a few thousand rows and loads them into a running ClickHouse
//! server over HTTP. Creates the target table if needed.
//!
//! Run with:
//! ```bash
//! CLICKHOUSE_URL=http://localhost:8123 \
//!     cargo run --package clickhouse-buffer --example push_rows
//! ```

use clickhouse_buffer::{
    row, Buffer, BufferConfig, ClientConfig, CompressionFormat, Conditions, HttpClient,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clickhouse_buffer=debug".into()),
        )
        .init();

    let client_config = ClientConfig {
        url: std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string()),
        ..Default::default()
    };
    let client = Arc::new(HttpClient::new(client_config)?);

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS default.buffer_demo \
             (id UInt64, kind String, ok UInt8, created_at DateTime) \
             ENGINE = MergeTree ORDER BY id",
        )
        .await?;

    let root = tempfile::tempdir()?;
    let directory = Buffer::prepare_directory(root.path(), "default", "buffer_demo", 0o755).await?;

    let config = BufferConfig {
        max_rows_in_memory: 500,
        max_rows_per_file: 250,
        conditions: Conditions {
            max_age_ms: Some(1_000),
            max_rows: Some(2_000),
        },
        segment_compression: Some(CompressionFormat::Brotli),
        load_compression: Some(CompressionFormat::Gzip),
        ..BufferConfig::new("buffer_demo", directory)
    };
    let buffer = Buffer::new(config, client.clone())?;
    let mut errors = buffer.subscribe_errors();

    // Pick up anything a previous run left behind.
    let recovered = buffer.load_files_to_database().await?;
    tracing::info!(recovered, "Recovery finished");

    for i in 0..5_000u64 {
        let kind = if i % 3 == 0 { "click" } else { "view" };
        buffer
            .push(row![i, kind, i % 7 != 0, chrono::Utc::now()])
            .await?;
    }

    buffer.flush().await?;
    buffer.settle().await;
    while buffer.load().await? > 0 {}

    while let Ok(error) = errors.try_recv() {
        tracing::warn!(operation = ?error.operation, message = %error.message, "Background error");
    }

    let count = client.execute("SELECT count() FROM default.buffer_demo").await?;
    tracing::info!(rows = %count.trim(), "Rows in table");

    buffer.release().await?;
    Ok(())
}
