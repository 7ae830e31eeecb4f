//! Store client.
//!
//! The buffer only needs one thing from ClickHouse: "run this INSERT with
//! this byte stream as its data". [`StoreClient`] is that seam; tests plug
//! in an in-process recorder, production uses [`HttpClient`].

use crate::compression::CompressionFormat;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::multiplexer::LoadStream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::io::ReaderStream;

/// One bulk insert.
pub struct InsertRequest {
    /// Full `INSERT ... FORMAT ...` statement.
    pub query: String,
    /// Row data, possibly compressed as a whole.
    pub data: LoadStream,
    /// Codec applied to `data`, if any.
    pub compression: Option<CompressionFormat>,
}

impl std::fmt::Debug for InsertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertRequest")
            .field("query", &self.query)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Submit the insert. `Ok` means the server acknowledged every row.
    async fn insert(&self, request: InsertRequest) -> Result<()>;

    /// Release connections. Further inserts may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// ClickHouse HTTP interface client.
///
/// Streams the insert body: the load stream is forwarded chunk by chunk,
/// never materialized in memory.
pub struct HttpClient {
    config: ClientConfig,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http,
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_client(config: ClientConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            closed: AtomicBool::new(false),
        }
    }

    fn request(&self, query: &str) -> Result<reqwest::RequestBuilder> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self
            .http
            .post(&self.config.url)
            .query(&[("query", query), ("database", self.config.database.as_str())])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Load(format!("ClickHouse request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Load(format!(
                "ClickHouse returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(body)
    }

    /// Run a statement without a data body (DDL, SELECT) and return the
    /// raw response text.
    pub async fn execute(&self, query: &str) -> Result<String> {
        let builder = self.request(query)?;
        self.send(builder).await
    }
}

#[async_trait]
impl StoreClient for HttpClient {
    #[tracing::instrument(skip(self, request), fields(compression = ?request.compression))]
    async fn insert(&self, request: InsertRequest) -> Result<()> {
        let mut builder = self
            .request(&request.query)?
            .body(reqwest::Body::wrap_stream(ReaderStream::new(request.data)));
        if let Some(compression) = request.compression {
            builder = builder.header("Content-Encoding", compression.tag());
        }
        self.send(builder).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        tracing::debug!(url = %self.config.url, "ClickHouse HTTP client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_closed_client_rejects_inserts() {
        let client = HttpClient::new(ClientConfig::default()).unwrap();
        client.close().await.unwrap();

        let request = InsertRequest {
            query: "INSERT INTO \"default\".\"events\" FORMAT JSONCompactEachRow".to_string(),
            data: Box::pin(Cursor::new(b"[1]\n".to_vec())),
            compression: None,
        };
        assert!(matches!(client.insert(request).await, Err(Error::Closed)));
        assert!(matches!(client.execute("SELECT 1").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_load_error() {
        let config = ClientConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_ms: 2_000,
            ..Default::default()
        };
        let client = HttpClient::new(config).unwrap();
        let request = InsertRequest {
            query: "INSERT INTO \"default\".\"events\" FORMAT JSONCompactEachRow".to_string(),
            data: Box::pin(Cursor::new(b"[1]\n".to_vec())),
            compression: Some(CompressionFormat::Gzip),
        };
        let err = client.insert(request).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, Error::Load(_)));
    }

    #[test]
    fn test_insert_request_debug_omits_stream() {
        let request = InsertRequest {
            query: "INSERT".to_string(),
            data: Box::pin(Cursor::new(Vec::new())),
            compression: None,
        };
        let debug = format!("{:?}", request);
        assert!(debug.contains("INSERT"));
        assert!(debug.contains(".."));
    }
}
