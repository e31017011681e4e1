//! Reassembly of segments that finish in any order into one ordered output.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod concat;
pub mod streaming;

pub use concat::ConcatJoiner;
pub use streaming::{AssemblyState, StreamingJoiner};

/// Collects processed segments and produces the final file.
///
/// `add` may be called concurrently from any number of workers, with indices
/// in any order. The output always follows index order.
#[async_trait]
pub trait Joiner: Send + Sync {
    async fn add(&self, index: usize, bytes: Bytes) -> Result<()>;

    /// Completes the output once every index has been added and returns its
    /// path.
    async fn finish(&self) -> Result<PathBuf>;
}
