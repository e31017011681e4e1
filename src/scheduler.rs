use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use tokio::{
    select,
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    decrypt::{decrypt, derive_iv},
    error::{Error, Result},
    http::Fetch,
    joiner::Joiner,
    keys::KeyCache,
    playlist::{Manifest, Segment},
    ts,
};

/// One unit of work: the segment that ends up at `index` in the output.
#[derive(Debug, Clone)]
pub struct SegmentTask {
    pub index: usize,
    pub segment: Segment,
}

impl From<&Segment> for SegmentTask {
    fn from(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            segment: segment.clone(),
        }
    }
}

/// What every worker shares.
struct Context {
    fetcher: Arc<dyn Fetch>,
    keys: Arc<KeyCache>,
    joiner: Arc<dyn Joiner>,
    done: AtomicUsize,
    total: usize,
}

impl Context {
    async fn process(&self, task: SegmentTask) -> Result<()> {
        let SegmentTask { index, segment } = task;
        let url = segment.uri.as_str();

        let mut bytes = self.fetcher.fetch(url).await?;

        if let Some(encryption) = &segment.encryption {
            let key = self.keys.get(encryption.key_uri.as_str()).await?;
            let iv = derive_iv(encryption.iv.as_deref(), segment.sequence).map_err(|source| {
                Error::Decryption {
                    url: url.to_string(),
                    source,
                }
            })?;

            let plain = tokio::task::spawn_blocking(move || decrypt(&bytes, &key, &iv))
                .await
                .map_err(|e| Error::Internal {
                    reason: format!("decryption task of segment {index} failed: {e}"),
                })?
                .map_err(|source| Error::Decryption {
                    url: url.to_string(),
                    source,
                })?;
            bytes = Bytes::from(plain);
        }

        if !segment.init {
            bytes = ts::repair(bytes);
        }

        self.joiner.add(index, bytes).await?;

        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("[{done}/{}] Segment {index} done: {url}", self.total);
        Ok(())
    }
}

/// Runs every segment of a manifest through a fixed pool of workers.
pub struct Scheduler {
    fetcher: Arc<dyn Fetch>,
    keys: Arc<KeyCache>,
    joiner: Arc<dyn Joiner>,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        keys: Arc<KeyCache>,
        joiner: Arc<dyn Joiner>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            keys,
            joiner,
            concurrency: concurrency.max(1),
        }
    }

    /// Downloads, decrypts and repairs every segment and hands it to the
    /// joiner. Returns once all segments went through.
    ///
    /// The first failing segment stops the run and aborts the other workers.
    ///
    /// # Errors
    /// The first segment error, or [`Error::Cancelled`] when `ct` fires
    pub async fn run(&self, manifest: &Manifest, ct: &CancellationToken) -> Result<()> {
        let total = manifest.len();
        let workers = self.concurrency.min(total.max(1));
        info!("Downloading {total} segments with {workers} workers");

        let context = Arc::new(Context {
            fetcher: self.fetcher.clone(),
            keys: self.keys.clone(),
            joiner: self.joiner.clone(),
            done: AtomicUsize::new(0),
            total,
        });

        let (tx, rx) = mpsc::channel::<SegmentTask>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let queue: Vec<SegmentTask> = manifest.segments().iter().map(SegmentTask::from).collect();
        tasks.spawn(async move {
            for task in queue {
                if tx.send(task).await.is_err() {
                    break;
                }
            }
            Ok(())
        });

        for _ in 0..workers {
            let rx = rx.clone();
            let context = context.clone();
            tasks.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(task) = next else {
                        return Ok(());
                    };
                    context.process(task).await?;
                }
            });
        }

        loop {
            select! {
                biased;
                () = ct.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(Error::Internal {
                            reason: format!("worker panicked: {e}"),
                        });
                    }
                }
            }
        }

        info!("Done downloading all {total} segments!");
        Ok(())
    }
}
