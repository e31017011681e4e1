use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{error::Result, http::Fetch};

/// Decryption keys fetched during a run, keyed by key URI.
///
/// The lock is held across a miss, so a key is downloaded at most once no
/// matter how many workers ask for it at the same time. Failed downloads are
/// not remembered; the next segment using the key tries again.
pub struct KeyCache {
    fetcher: Arc<dyn Fetch>,
    keys: Mutex<HashMap<String, Bytes>>,
}

impl KeyCache {
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            fetcher,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Errors when the key is not cached and fetching it fails
    pub async fn get(&self, uri: &str) -> Result<Bytes> {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get(uri) {
            return Ok(key.clone());
        }

        debug!("Fetching key {uri}");
        let key = self.fetcher.fetch(uri).await?;
        keys.insert(uri.to_string(), key.clone());
        Ok(key)
    }
}
