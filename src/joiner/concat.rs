use std::{
    collections::{BTreeMap, btree_map::Entry},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Joiner;
use crate::{
    error::{Error, Result},
    ffmpeg::{MergeService, concat_list},
};

const MERGE_LIST_NAME: &str = "merge_list.txt";
const FRAGMENTED_NAME: &str = "fragmented.mp4";

/// Parks every segment in its own temporary file and hands the ordered list
/// to a [`MergeService`] at the end.
///
/// Transport stream segments are listed one by one. Fragmented MP4 pieces
/// cannot be opened on their own, so when index 0 is an initialization
/// section everything is first glued into a single file and that is listed
/// instead.
///
/// The temporary directory goes away after a successful merge, or when the
/// joiner is dropped after a failed run.
pub struct ConcatJoiner {
    output: PathBuf,
    total: usize,
    has_init: bool,
    merger: Arc<dyn MergeService>,
    dir: Mutex<Option<TempDir>>,
    dir_path: PathBuf,
    blocks: Mutex<BTreeMap<usize, PathBuf>>,
}

impl ConcatJoiner {
    /// Creates the temporary directory under `temp_root`.
    ///
    /// `has_init` says whether index 0 is a fragmented MP4 initialization
    /// section.
    ///
    /// # Errors
    /// Errors when the temporary directory cannot be created
    pub fn create(
        output: impl AsRef<Path>,
        total: usize,
        has_init: bool,
        temp_root: &Path,
        merger: Arc<dyn MergeService>,
    ) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("m3u8_cache_")
            .tempdir_in(temp_root)?;
        let dir_path = std::path::absolute(dir.path())?;
        debug!("Caching segments in {dir_path:?}");

        Ok(Self {
            output: output.as_ref().to_path_buf(),
            total,
            has_init,
            merger,
            dir: Mutex::new(Some(dir)),
            dir_path,
            blocks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir_path
    }

    const fn extension(&self) -> &'static str {
        if self.has_init { "mp4" } else { "ts" }
    }

    /// Writes the initialization section and all fragments into one file.
    async fn glue_fragments(&self, files: &[PathBuf]) -> Result<PathBuf> {
        let path = self.dir_path.join(FRAGMENTED_NAME);
        let mut out = tokio::io::BufWriter::new(tokio::fs::File::create(&path).await?);
        for file in files {
            let mut input = tokio::fs::File::open(file).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        Ok(path)
    }

    /// Paths of all segments by ascending index.
    fn ordered_blocks(&self) -> Result<Vec<PathBuf>> {
        let blocks = self.blocks.lock();
        (0..self.total)
            .map(|index| {
                blocks.get(&index).cloned().ok_or(Error::AssemblyContract {
                    index,
                    reason: "segment never arrived",
                })
            })
            .collect()
    }
}

#[async_trait]
impl Joiner for ConcatJoiner {
    async fn add(&self, index: usize, bytes: Bytes) -> Result<()> {
        if index >= self.total {
            return Err(Error::AssemblyContract {
                index,
                reason: "index is beyond the end of the manifest",
            });
        }

        let path = self.dir_path.join(format!("{index}.{}", self.extension()));
        match self.blocks.lock().entry(index) {
            Entry::Occupied(_) => {
                return Err(Error::AssemblyContract {
                    index,
                    reason: "index was already added",
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(path.clone());
            }
        }

        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            self.blocks.lock().remove(&index);
            return Err(e.into());
        }
        Ok(())
    }

    async fn finish(&self) -> Result<PathBuf> {
        let mut files = self.ordered_blocks()?;
        let segments = files.len();
        if self.has_init {
            files = vec![self.glue_fragments(&files).await?];
        }

        let list_path = self.dir_path.join(MERGE_LIST_NAME);
        tokio::fs::write(&list_path, concat_list(&files)).await?;

        info!("Merging {segments} segments into {:?}", self.output);
        self.merger.merge(&list_path, &self.output).await?;

        let dir = self.dir.lock().take();
        if let Some(dir) = dir {
            dir.close()?;
        }

        Ok(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Stands in for ffmpeg by concatenating the listed files itself.
    #[derive(Default)]
    struct CatMerger {
        listed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MergeService for CatMerger {
        async fn merge(&self, list: &Path, output: &Path) -> Result<()> {
            let list = std::fs::read_to_string(list)?;
            let mut out = std::fs::File::create(output)?;
            for line in list.lines() {
                self.listed.lock().push(line.to_string());
                let path = line
                    .strip_prefix("file '")
                    .and_then(|l| l.strip_suffix('\''))
                    .ok_or_else(|| Error::merge(format!("bad list line {line}")))?;
                out.write_all(&std::fs::read(path)?)?;
            }
            Ok(())
        }
    }

    struct FailingMerger;

    #[async_trait]
    impl MergeService for FailingMerger {
        async fn merge(&self, _list: &Path, _output: &Path) -> Result<()> {
            Err(Error::merge("ffmpeg exited with exit status: 1"))
        }
    }

    #[tokio::test]
    async fn merges_in_index_order_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out.ts");
        let joiner = ConcatJoiner::create(&output, 3, false, root.path(), Arc::new(CatMerger::default())).unwrap();
        let cache_dir = joiner.cache_dir().to_path_buf();

        joiner.add(1, Bytes::from_static(b"seg1")).await.unwrap();
        joiner.add(2, Bytes::from_static(b"seg2")).await.unwrap();
        joiner.add(0, Bytes::from_static(b"seg0")).await.unwrap();

        assert!(cache_dir.join("2.ts").exists());
        assert_eq!(joiner.finish().await.unwrap(), output);
        assert_eq!(std::fs::read(&output).unwrap(), b"seg0seg1seg2");
        assert!(!cache_dir.exists());
    }

    #[tokio::test]
    async fn missing_index_fails_before_merging() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out.ts");
        let joiner = ConcatJoiner::create(&output, 3, false, root.path(), Arc::new(CatMerger::default())).unwrap();

        joiner.add(0, Bytes::from_static(b"seg0")).await.unwrap();
        joiner.add(2, Bytes::from_static(b"seg2")).await.unwrap();

        let err = joiner.finish().await.unwrap_err();
        assert!(matches!(err, Error::AssemblyContract { index: 1, .. }));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn failed_merge_removes_cache_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let joiner = ConcatJoiner::create(
            root.path().join("out.ts"),
            1,
            false,
            root.path(),
            Arc::new(FailingMerger),
        )
        .unwrap();
        let cache_dir = joiner.cache_dir().to_path_buf();

        joiner.add(0, Bytes::from_static(b"seg0")).await.unwrap();
        assert!(matches!(joiner.finish().await, Err(Error::Merge { .. })));
        assert!(cache_dir.exists());

        drop(joiner);
        assert!(!cache_dir.exists());
    }

    #[tokio::test]
    async fn duplicate_index_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let joiner = ConcatJoiner::create(
            root.path().join("out.ts"),
            2,
            false,
            root.path(),
            Arc::new(CatMerger::default()),
        )
        .unwrap();

        joiner.add(0, Bytes::from_static(b"seg0")).await.unwrap();
        let err = joiner.add(0, Bytes::from_static(b"again")).await.unwrap_err();
        assert!(matches!(err, Error::AssemblyContract { index: 0, .. }));
    }

    #[tokio::test]
    async fn fragments_are_merged_behind_their_init_section() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("show.mkv");
        let merger = Arc::new(CatMerger::default());
        let joiner = ConcatJoiner::create(&output, 3, true, root.path(), merger.clone()).unwrap();
        let cache_dir = joiner.cache_dir().to_path_buf();

        joiner.add(2, Bytes::from_static(b"[moof2]")).await.unwrap();
        joiner.add(0, Bytes::from_static(b"[ftyp+moov]")).await.unwrap();
        joiner.add(1, Bytes::from_static(b"[moof1]")).await.unwrap();
        assert!(cache_dir.join("1.mp4").exists());

        joiner.finish().await.unwrap();
        assert_eq!(
            std::fs::read(&output).unwrap(),
            b"[ftyp+moov][moof1][moof2]"
        );

        let listed = merger.listed.lock();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("fragmented.mp4'"));
    }

    #[tokio::test]
    async fn segment_files_are_named_by_content_not_output() {
        let root = tempfile::tempdir().unwrap();
        let merger = Arc::new(CatMerger::default());
        let joiner = ConcatJoiner::create(
            root.path().join("show.mkv"),
            2,
            false,
            root.path(),
            merger.clone(),
        )
        .unwrap();
        let cache_dir = joiner.cache_dir().to_path_buf();

        joiner.add(0, Bytes::from_static(b"seg0")).await.unwrap();
        joiner.add(1, Bytes::from_static(b"seg1")).await.unwrap();
        assert!(cache_dir.join("0.ts").exists());
        assert!(!cache_dir.join("0.mkv").exists());

        joiner.finish().await.unwrap();
        assert_eq!(merger.listed.lock().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_adds_of_one_index_keep_a_single_slot() {
        let root = tempfile::tempdir().unwrap();
        let joiner = Arc::new(
            ConcatJoiner::create(
                root.path().join("out.ts"),
                1,
                false,
                root.path(),
                Arc::new(CatMerger::default()),
            )
            .unwrap(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let joiner = joiner.clone();
            tasks.spawn(async move { joiner.add(0, Bytes::from_static(b"seg0")).await });
        }

        let accepted = tasks
            .join_all()
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
