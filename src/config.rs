use std::{path::PathBuf, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Timeout used when a non-positive one was configured.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How finished segments are assembled into the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStrategy {
    /// Append segments to the output as soon as they are next in line.
    Streaming,
    /// Write each segment to a temporary file and let ffmpeg concatenate them.
    Ffmpeg { binary: PathBuf },
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Playlist URL or path to a local playlist file
    pub input: String,
    /// Base for relative URIs of a local playlist
    pub base_url: Option<Url>,
    /// Preferred variant as `WIDTHxHEIGHT`
    pub resolution: Option<String>,
    pub output: Option<PathBuf>,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub no_proxy: bool,
    pub insecure: bool,
    pub headers: HeaderMap,
    pub strategy: JoinStrategy,
    /// Where the ffmpeg strategy keeps its per-segment files (defaults to the system's temporary directory)
    pub temp_dir: Option<PathBuf>,
}

impl DownloadConfig {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            base_url: None,
            resolution: None,
            output: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            no_proxy: false,
            insecure: false,
            headers: HeaderMap::new(),
            strategy: JoinStrategy::Streaming,
            temp_dir: None,
        }
    }

    /// Replaces nonsensical values with usable ones.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.timeout.is_zero() {
            self.timeout = FALLBACK_TIMEOUT;
        }
        self
    }
}

/// Parses headers given as `Name=Value;Other=Value`.
///
/// A name without `=` is sent with an empty value.
///
/// # Errors
/// Errors when a header name or value is not valid HTTP
pub fn parse_headers(input: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for pair in input.split(';').filter(|p| !p.trim().is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = name.trim();

        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        headers.insert(header_name, header_value);
    }

    Ok(headers)
}
