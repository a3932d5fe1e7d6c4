//! HTTP plumbing for linkferry
//!
//! Client construction, request sending with a bounded wait for headers, and
//! a fixed-size chunk reader over a response body.

use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response};

use crate::core::config::TransferConfig;
use crate::core::error::{Error, Result};

/// Build the HTTP client used for probing, resolving and downloading.
///
/// No overall request timeout is set: a multi-gigabyte body may legitimately
/// take hours. Silence is bounded per read instead, see [`ChunkedBody`].
///
/// The caller's `Referer` survives redirects unchanged, and bodies are never
/// decompressed: byte offsets must match what `Content-Range` counts.
pub fn build_client(config: &TransferConfig) -> Result<Client> {
    ClientBuilder::new()
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(config.connect_timeout())
        .user_agent(config.user_agent.as_str())
        .referer(false)
        .no_gzip()
        .no_brotli()
        .build()
        .map_err(Error::from)
}

/// Send a request, giving up if no response headers arrive within `wait`
pub async fn send_with_timeout(request: RequestBuilder, wait: Duration) -> Result<Response> {
    match tokio::time::timeout(wait, request.send()).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::NetworkError(format!(
            "no response within {}s",
            wait.as_secs_f64()
        ))),
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Re-chunks a response body into blocks of a fixed size.
///
/// The network delivers arbitrarily sized frames; the engine wants to write
/// and account in predictable blocks. The last block may be shorter.
pub struct ChunkedBody {
    inner: ByteStream,
    buffer: BytesMut,
    chunk_size: usize,
    read_timeout: Duration,
    finished: bool,
}

impl ChunkedBody {
    pub fn new(response: Response, chunk_size: usize, read_timeout: Duration) -> Self {
        Self {
            inner: Box::pin(response.bytes_stream()),
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
            read_timeout,
            finished: false,
        }
    }

    /// Next block of at most `chunk_size` bytes, `None` on clean end of stream.
    ///
    /// A stalled read, a reset connection or a broken payload is reported as
    /// a transient [`Error::NetworkError`]; bytes buffered but not yet handed
    /// out are discarded with it, so the caller's offset stays exact.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buffer.len() >= self.chunk_size {
                return Ok(Some(self.buffer.split_to(self.chunk_size).freeze()));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buffer.split().freeze()));
            }

            match tokio::time::timeout(self.read_timeout, self.inner.next()).await {
                Err(_) => {
                    return Err(Error::NetworkError(format!(
                        "stream stalled for {}s",
                        self.read_timeout.as_secs_f64()
                    )))
                }
                Ok(None) => self.finished = true,
                Ok(Some(Err(err))) => {
                    return Err(Error::NetworkError(format!("stream read error: {err}")))
                }
                Ok(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_chunked_body_yields_fixed_blocks() {
        let mock_server = MockServer::start().await;
        let body: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let client = build_client(&TransferConfig::default()).unwrap();
        let url = format!("{}/blob", mock_server.uri());
        let response = send_with_timeout(client.get(&url), Duration::from_secs(5))
            .await
            .unwrap();

        let mut chunks = ChunkedBody::new(response, 1000, Duration::from_secs(5));
        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        while let Some(chunk) = chunks.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            collected.extend_from_slice(&chunk);
        }

        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn test_slow_headers_are_a_transient_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = build_client(&TransferConfig::default()).unwrap();
        let result = send_with_timeout(client.get(mock_server.uri()), Duration::from_millis(100)).await;

        match result {
            Err(err) => assert!(err.is_transient(), "unexpected error kind: {err:?}"),
            Ok(_) => panic!("request should have timed out"),
        }
    }
}
