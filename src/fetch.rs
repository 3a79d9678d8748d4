use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Http(StatusCode),
    #[error("Network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Http(status)
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Downloads the raw text of an upstream playlist
pub trait PlaylistFetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    /// Delay before the first retry, doubled for each following one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub const fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let res = self
            .client
            .get(url)
            .timeout(self.policy.timeout)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::Http(status));
        }

        Ok(res.text().await?)
    }
}

impl PlaylistFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let attempts = self.policy.retries + 1;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_before(attempt)).await;
            }
            attempt += 1;

            match self.fetch_once(url).await {
                Ok(body) => {
                    debug!("Fetched {} bytes", body.len());
                    return Ok(body);
                }
                Err(e) if attempt < attempts => {
                    warn!("Attempt {attempt}/{attempts} failed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    /// A canned reply of the in-test HTTP server
    #[derive(Debug, Clone)]
    pub(crate) struct Reply {
        pub status: u16,
        pub content_type: &'static str,
        pub body: String,
        pub delay: Duration,
    }

    impl Reply {
        pub(crate) fn ok(body: &str) -> Self {
            Self {
                status: 200,
                content_type: "text/plain",
                body: body.to_string(),
                delay: Duration::ZERO,
            }
        }

        pub(crate) fn status(status: u16) -> Self {
            Self {
                status,
                ..Self::ok("")
            }
        }
    }

    /// Serves `replies` in order, one per connection, repeating the last one.
    /// Returns the base URL and a counter of handled requests.
    pub(crate) async fn serve(replies: Vec<Reply>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let reply = replies[n.min(replies.len() - 1)].clone();

                tokio::spawn(async move {
                    let mut request_line = String::new();
                    {
                        let mut reader = BufReader::new(&mut stream);
                        let mut line = String::new();
                        while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                            if request_line.is_empty() {
                                request_line.clone_from(&line);
                            }
                            if line == "\r\n" {
                                break;
                            }
                            line.clear();
                        }
                    }

                    tokio::time::sleep(reply.delay).await;
                    let body = if request_line.starts_with("HEAD") {
                        ""
                    } else {
                        reply.body.as_str()
                    };
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        reply.status,
                        reply.content_type,
                        reply.body.len(),
                        body
                    );
                    stream.write_all(response.as_bytes()).await.ok();
                    stream.shutdown().await.ok();
                });
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn fetcher(timeout: Duration, retries: u32) -> HttpFetcher {
        HttpFetcher::new(
            reqwest::Client::new(),
            RetryPolicy {
                timeout,
                retries,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn fetches_playlist_text() {
        let (base, hits) = serve(vec![Reply::ok("#EXTM3U\n")]).await;

        let body = fetcher(Duration::from_secs(5), 2)
            .fetch(&format!("{base}/list.m3u"))
            .await
            .unwrap();

        assert_eq!(body, "#EXTM3U\n");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (base, hits) = serve(vec![
            Reply::status(503),
            Reply::status(500),
            Reply::ok("#EXTM3U\n"),
        ])
        .await;

        let body = fetcher(Duration::from_secs(5), 2)
            .fetch(&format!("{base}/list.m3u"))
            .await
            .unwrap();

        assert_eq!(body, "#EXTM3U\n");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_http_status() {
        let (base, hits) = serve(vec![Reply::status(404)]).await;

        let err = fetcher(Duration::from_secs(5), 1)
            .fetch(&format!("{base}/list.m3u"))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Http(StatusCode::NOT_FOUND));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let (base, _) = serve(vec![Reply {
            delay: Duration::from_secs(5),
            ..Reply::ok("#EXTM3U\n")
        }])
        .await;

        let err = fetcher(Duration::from_millis(100), 0)
            .fetch(&format!("{base}/list.m3u"))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Timeout);
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher(Duration::from_secs(2), 0)
            .fetch(&format!("http://{addr}/list.m3u"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Network(_)));
    }
}
