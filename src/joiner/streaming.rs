use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::debug;

use super::Joiner;
use crate::error::{Error, Result};

/// Reorder buffer in front of the output.
///
/// `pending` only ever holds indices above `next`; an index equal to `next`
/// is released right away together with any run that follows it.
#[derive(Debug, Default)]
pub struct AssemblyState {
    next: usize,
    total: usize,
    pending: BTreeMap<usize, Bytes>,
}

impl AssemblyState {
    pub fn new(total: usize) -> Self {
        Self {
            next: 0,
            total,
            pending: BTreeMap::new(),
        }
    }

    pub const fn next(&self) -> usize {
        self.next
    }

    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.keys().copied()
    }

    pub const fn is_complete(&self) -> bool {
        self.next == self.total
    }

    /// Accepts a segment and returns every chunk that is now ready to be
    /// written, in order.
    ///
    /// # Errors
    /// [`Error::AssemblyContract`] for an index that is out of range or was
    /// already accepted
    pub fn push(&mut self, index: usize, bytes: Bytes) -> Result<Vec<Bytes>> {
        if index >= self.total {
            return Err(Error::AssemblyContract {
                index,
                reason: "index is beyond the end of the manifest",
            });
        }
        if index < self.next || self.pending.contains_key(&index) {
            return Err(Error::AssemblyContract {
                index,
                reason: "index was already added",
            });
        }

        self.pending.insert(index, bytes);

        let mut ready = Vec::new();
        while let Some(bytes) = self.pending.remove(&self.next) {
            ready.push(bytes);
            self.next += 1;
        }
        Ok(ready)
    }
}

struct Inner {
    state: AssemblyState,
    file: Option<BufWriter<File>>,
}

/// Writes segments straight into the output file as soon as they are next in
/// line, holding back the ones that arrived early.
///
/// A failed run leaves whatever was written so far on disk.
pub struct StreamingJoiner {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl StreamingJoiner {
    /// Creates (or truncates) the output file.
    ///
    /// # Errors
    /// Errors when the file cannot be created
    pub async fn create(path: impl AsRef<Path>, total: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                state: AssemblyState::new(total),
                file: Some(BufWriter::new(file)),
            }),
        })
    }
}

#[async_trait]
impl Joiner for StreamingJoiner {
    async fn add(&self, index: usize, bytes: Bytes) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Inner { state, file } = &mut *inner;

        let ready = state.push(index, bytes)?;
        let file = file.as_mut().ok_or(Error::AssemblyContract {
            index,
            reason: "output was already finished",
        })?;
        for chunk in ready {
            file.write_all(&chunk).await?;
        }

        debug!(index, next = state.next(), "Segment queued for output");
        Ok(())
    }

    async fn finish(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock().await;

        if !inner.state.is_complete() {
            return Err(Error::AssemblyContract {
                index: inner.state.next(),
                reason: "segment never arrived",
            });
        }

        if let Some(mut file) = inner.file.take() {
            file.flush().await?;
            file.into_inner().sync_all().await?;
        }

        Ok(self.path.clone())
    }
}
