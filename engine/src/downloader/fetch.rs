//! Network collaborator: byte-range capable HTTP GET

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sdk::errors::EngineError;
use std::time::Duration;

/// Body chunks as produced by the network layer
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, EngineError>>;

/// Response head plus streaming body
pub struct FetchResponse {
    pub status: u16,
    /// Length of this response body, not of the whole resource
    pub content_length: Option<u64>,
    pub body: ChunkStream,
}

/// Performs a GET, optionally starting at a byte offset
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str, range_start: Option<u64>) -> Result<FetchResponse, EngineError>;
}

/// `reqwest`-backed fetcher
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("plexus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, range_start: Option<u64>) -> Result<FetchResponse, EngineError> {
        let mut request = self.client.get(url);
        if let Some(start) = range_start {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", start));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| EngineError::Network(format!("Error reading download stream: {}", e)))
            })
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            body,
        })
    }
}
