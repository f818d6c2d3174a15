use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("no store registered for scheme {0:?}")]
    UnknownScheme(String),
}

/// Narrow keyed storage contract backing a table: get/set/del/iterate, no
/// transactional requirements. Recoverability comes from the changelog, not
/// from the store.
impl std::fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Store").finish_non_exhaustive()
    }
}

pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    fn set(&self, key: Bytes, value: Bytes);

    /// Removes a key; returns whether it was present.
    fn del(&self, key: &[u8]) -> bool;

    /// Streams the mapping in key order without materializing it. Writes
    /// landing behind the cursor during the walk are not revisited.
    fn iter(&self) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + '_>;

    /// Eager copy of the whole mapping, for small tables and tests.
    fn snapshot(&self) -> Vec<(Bytes, Bytes)> {
        self.iter().collect()
    }

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves a backing store from a URL at table-bind time.
pub fn by_url(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        other => Err(StoreError::UnknownScheme(other.to_owned())),
    }
}
