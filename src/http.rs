use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use reqwest::{
    StatusCode,
    header::{HeaderMap, HeaderValue, USER_AGENT},
};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::{
    config::DownloadConfig,
    error::{Error, Result},
};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can turn a URL into a response body.
///
/// Everything downstream of the playlist talks to the network through this,
/// so tests can swap in canned responses.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Settings needed to (re)build the underlying HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
    /// Ignore proxies from the environment as well.
    pub no_proxy: bool,
    pub insecure: bool,
}

impl ClientOptions {
    fn build(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if self.no_proxy {
            builder = builder.no_proxy();
        } else if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|source| Error::Network {
                url: proxy.clone(),
                source,
            })?;
            builder = builder.proxy(proxy);
        }
        if self.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(|source| Error::Network {
            url: String::new(),
            source,
        })
    }
}

/// Retrying GET client shared by every worker of a run.
pub struct HttpFetcher {
    client: RwLock<reqwest::Client>,
    options: ClientOptions,
    headers: HeaderMap,
    max_attempts: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    /// # Errors
    /// Errors when the proxy URL is invalid or the TLS backend fails to initialize
    pub fn new(
        options: ClientOptions,
        headers: HeaderMap,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: RwLock::new(options.build()?),
            options,
            headers,
            max_attempts: max_attempts.max(1),
            retry_delay,
        })
    }

    /// # Errors
    /// See [`HttpFetcher::new`]
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        Self::new(
            ClientOptions {
                timeout: Some(config.timeout),
                proxy: config.proxy.clone(),
                no_proxy: config.no_proxy,
                insecure: config.insecure,
            },
            config.headers.clone(),
            config.max_attempts,
            config.retry_delay,
        )
    }

    /// GETs `url`, retrying up to `max_attempts` times on transport errors,
    /// non-2xx statuses and empty bodies.
    ///
    /// # Errors
    /// Returns the error of the last attempt once the budget is exhausted
    pub async fn get(
        &self,
        url: &str,
        headers: &HeaderMap,
        max_attempts: u32,
    ) -> Result<(StatusCode, Bytes)> {
        let headers = request_headers(headers);
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let client = self.client.read().clone();

            let err = match Self::get_once(&client, url, &headers).await {
                Ok((status, body)) if status.is_success() && !body.is_empty() => {
                    return Ok((status, body));
                }
                Ok((status, _)) if status.is_success() => Error::EmptyBody {
                    url: url.to_string(),
                    status,
                },
                Ok((status, _)) => Error::HttpStatus {
                    url: url.to_string(),
                    status,
                },
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            if let Error::Network { source, .. } = &err
                && is_dead_connection(source)
            {
                warn!("Connection to {url} looks dead, dropping pooled connections");
                self.reset_connections()?;
            }

            warn!(attempt, max_attempts, "Retrying {url}: {err}");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn get_once(
        client: &reqwest::Client,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(StatusCode, Bytes)> {
        let network = |source| Error::Network {
            url: url.to_string(),
            source,
        };

        let res = client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(network)?;
        let status = res.status();

        let mut body = BytesMut::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.map_err(network)?);
        }

        let body = body.freeze();
        debug!("GET {url} -> {status} ({} bytes)", body.len());
        Ok((status, body))
    }

    /// Replaces the client so that its idle connections are dropped along with
    /// the old pool once in-flight requests finish.
    fn reset_connections(&self) -> Result<()> {
        let fresh = self.options.build()?;
        *self.client.write() = fresh;
        Ok(())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.get(url, &self.headers, self.max_attempts)
            .await
            .map(|(_, body)| body)
    }
}

/// Default headers with the caller's set layered on top.
fn request_headers(extra: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    for (name, value) in extra {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

/// Whether a transport error means the pooled connection is unusable.
///
/// HTTP/2 servers that drop a stream with `INTERNAL_ERROR` tend to keep
/// failing on the same connection until it is thrown away. The h2 error may
/// sit behind an `io::Error`, whose `source()` skips the wrapped error, so
/// those are unwrapped explicitly.
fn is_dead_connection(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(h2_err) = e.downcast_ref::<h2::Error>()
            && h2_err.reason() == Some(h2::Reason::INTERNAL_ERROR)
        {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
            if let Some(inner) = io.get_ref()
                && is_dead_connection(inner)
            {
                return true;
            }
        }
        source = e.source();
    }
    false
}
