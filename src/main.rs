#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use m3u8_squirrel::{
    config::{self, DownloadConfig, JoinStrategy},
    util::spawn_ct_watcher,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Downloads an HLS (m3u8) stream into a single media file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Playlist URL or path to a local m3u8 file
    input: String,

    /// The amount of parallel downloads
    #[arg(short = 'n', long = "threads", default_value_t = config::DEFAULT_CONCURRENCY)]
    threads: usize,

    /// Output file (defaults to the name of the first segment)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Attempts per request before giving up
    #[arg(short, long, default_value_t = config::DEFAULT_MAX_ATTEMPTS)]
    retry: u32,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value_t = config::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Proxy for every request, e.g. `socks5://127.0.0.1:1080`
    #[arg(short, long)]
    proxy: Option<String>,

    /// Ignore proxies configured through the environment
    #[arg(long, conflicts_with = "proxy")]
    no_proxy: bool,

    /// Extra request headers as `Name=Value;Name2=Value2`
    #[arg(short = 'H', long)]
    headers: Option<String>,

    /// Variant to pick from a master playlist, as `WIDTHxHEIGHT`
    #[arg(long)]
    resolution: Option<String>,

    /// Base URL for relative URIs in a local playlist
    #[arg(long)]
    base_url: Option<Url>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Merge segments with ffmpeg instead of appending them directly
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "ffmpeg")]
    ffmpeg: Option<PathBuf>,

    /// Directory for ffmpeg's intermediate files (defaults to system's temporary directory)
    #[arg(long)]
    temp_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<DownloadConfig> {
        let headers = self
            .headers
            .as_deref()
            .map(config::parse_headers)
            .transpose()
            .context("Parsing request headers")?
            .unwrap_or_default();

        if let Some(dir) = &self.temp_dir
            && !dir.is_dir()
        {
            bail!("Provided temporary directory {dir:?} is not a valid directory!");
        }

        let mut config = DownloadConfig::new(self.input);
        config.base_url = self.base_url;
        config.resolution = self.resolution;
        config.output = self.output;
        config.concurrency = self.threads;
        config.max_attempts = self.retry;
        config.timeout = Duration::from_secs(self.timeout);
        config.proxy = self.proxy;
        config.no_proxy = self.no_proxy;
        config.insecure = self.insecure;
        config.headers = headers;
        config.strategy = self
            .ffmpeg
            .map_or(JoinStrategy::Streaming, |binary| JoinStrategy::Ffmpeg { binary });
        config.temp_dir = self.temp_dir;

        Ok(config.normalized())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.into_config()?;
    info!("Downloading {}", config.input);

    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    let output = m3u8_squirrel::download(config, ct)
        .await
        .context("Downloading stream")?;

    info!("Download succeeded!");
    info!("Final file path: {output:?}");

    Ok(())
}
