use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct StreamReply {
    pub status: u16,
    pub chunks: ChunkStream,
}

impl StreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body, for error replies.
    pub async fn into_text(mut self) -> String {
        let mut bytes = Vec::new();
        while let Some(Ok(chunk)) = self.chunks.next().await {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One JSON POST, either buffered or as a byte stream.
pub trait ChatTransport: Send + Sync {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        bearer: Option<&'a str>,
        timeout: Duration,
    ) -> TransportFuture<'a, HttpReply>;

    fn post_stream<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        bearer: Option<&'a str>,
        timeout: Duration,
    ) -> TransportFuture<'a, StreamReply>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let request = self.client.post(url).timeout(timeout).json(body);
        match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ChatTransport for ReqwestTransport {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        bearer: Option<&'a str>,
        timeout: Duration,
    ) -> TransportFuture<'a, HttpReply> {
        Box::pin(async move {
            let response = self.request(url, body, bearer, timeout).send().await?;
            let status = response.status().as_u16();
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            Ok(HttpReply {
                status,
                body,
                retry_after,
            })
        })
    }

    fn post_stream<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        bearer: Option<&'a str>,
        timeout: Duration,
    ) -> TransportFuture<'a, StreamReply> {
        Box::pin(async move {
            let response = self.request(url, body, bearer, timeout).send().await?;
            let status = response.status().as_u16();
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from))
                .boxed();
            Ok(StreamReply { status, chunks })
        })
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}
