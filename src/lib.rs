#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::missing_errors_doc)]

//! Downloads an HLS stream: resolves the playlist, fetches and decrypts every
//! segment concurrently, and reassembles them in order into one file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::{DownloadConfig, JoinStrategy},
    error::{Error, Result},
    ffmpeg::Ffmpeg,
    http::{Fetch, HttpFetcher},
    joiner::{ConcatJoiner, Joiner, StreamingJoiner},
    keys::KeyCache,
    playlist::{Manifest, PlaylistSource},
    scheduler::Scheduler,
    util::output_file_name,
};

pub mod config;
pub mod decrypt;
pub mod error;
pub mod ffmpeg;
pub mod http;
pub mod joiner;
pub mod keys;
pub mod playlist;
pub mod scheduler;
pub mod ts;
pub mod util;

/// Runs a whole download and returns the path of the finished file.
pub async fn download(config: DownloadConfig, ct: CancellationToken) -> Result<PathBuf> {
    let config = config.normalized();
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::from_config(&config)?);

    let source = PlaylistSource::from_input(&config.input, config.base_url.clone()).await?;
    let manifest = playlist::resolve(fetcher.as_ref(), source, config.resolution.as_deref()).await?;
    info!("Found {} segments to download!", manifest.len());

    let output = output_path(&config, &manifest)?;
    info!("Will save to {output:?}");

    let joiner = build_joiner(&config, &manifest, &output).await?;
    let keys = Arc::new(KeyCache::new(fetcher.clone()));

    Scheduler::new(fetcher, keys, joiner.clone(), config.concurrency)
        .run(&manifest, &ct)
        .await?;

    joiner.finish().await
}

fn output_path(config: &DownloadConfig, manifest: &Manifest) -> Result<PathBuf> {
    if let Some(output) = &config.output {
        return Ok(output.clone());
    }

    manifest
        .first_media()
        .map(|segment| PathBuf::from(output_file_name(&segment.uri)))
        .ok_or_else(|| Error::playlist("playlist has no media segments to name the output after"))
}

async fn build_joiner(
    config: &DownloadConfig,
    manifest: &Manifest,
    output: &Path,
) -> Result<Arc<dyn Joiner>> {
    match &config.strategy {
        JoinStrategy::Streaming => Ok(Arc::new(
            StreamingJoiner::create(output, manifest.len()).await?,
        )),
        JoinStrategy::Ffmpeg { binary } => {
            let ffmpeg = Ffmpeg::new(binary.clone());
            if !ffmpeg.is_installed().await {
                return Err(Error::merge(format!(
                    "`{}` is not installed or cannot be run",
                    binary.display()
                )));
            }

            let temp_root = config.temp_dir.clone().unwrap_or_else(std::env::temp_dir);

            Ok(Arc::new(ConcatJoiner::create(
                output,
                manifest.len(),
                manifest.has_init(),
                &temp_root,
                Arc::new(ffmpeg),
            )?))
        }
    }
}
