use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// External step that concatenates the files named in a list into `output`.
///
/// The list holds one `file '<path>'` line per input, in output order.
#[async_trait]
pub trait MergeService: Send + Sync {
    async fn merge(&self, list: &Path, output: &Path) -> Result<()>;
}

/// Merges through ffmpeg's concat demuxer, copying streams without
/// re-encoding.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks if ffmpeg can be run at all
    pub async fn is_installed(&self) -> bool {
        debug!("Checking for ffmpeg installation at {:?}", self.binary);
        tokio::process::Command::new(&self.binary)
            .arg("-version")
            .stderr(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl MergeService for Ffmpeg {
    /// See: <https://trac.ffmpeg.org/wiki/Concatenate#demuxer>
    async fn merge(&self, list: &Path, output: &Path) -> Result<()> {
        let child = match tokio::process::Command::new(&self.binary)
            .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(list)
            .args(["-c", "copy"])
            .arg(output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::merge(format!(
                    "`{}` is not installed or available in PATH",
                    self.binary.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let out = child.wait_with_output().await?;
        if !out.status.success() {
            error!("Video concatenation is unsuccessful");
            error!("stdout: {}", String::from_utf8_lossy(&out.stdout));
            error!("stderr: {}", String::from_utf8_lossy(&out.stderr));
            return Err(Error::merge(format!("ffmpeg exited with {}", out.status)));
        }

        Ok(())
    }
}

/// Renders the concat demuxer's input list.
///
/// Single quotes inside a path are closed, escaped and reopened the way the
/// demuxer expects.
pub fn concat_list<P: AsRef<Path>>(files: impl IntoIterator<Item = P>) -> String {
    files
        .into_iter()
        .map(|f| {
            let path = f.as_ref().to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}
