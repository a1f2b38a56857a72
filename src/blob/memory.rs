//! In-memory blob store.
//!
//! [`InMemoryBlobStore`] keeps objects in a `DashMap<(bucket, key), bytes>`.
//! It backs tests and local runs where no real object store is configured.

use async_trait::async_trait;
use dashmap::DashMap;

use super::BlobStore;
use crate::error::BlobError;

/// Thread-safe in-memory [`BlobStore`].
///
/// # Examples
///
/// ```
/// use flock::blob::memory::InMemoryBlobStore;
///
/// let store = InMemoryBlobStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects across all buckets.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns `true` if an object exists at `bucket/key`.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        self.objects
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
