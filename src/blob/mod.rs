//! Blob storage for oversized transport envelopes and saved artifacts.
//!
//! The [`BlobStore`] trait is the contract every storage engine implements:
//! opaque bytes in, opaque bytes out, addressed by `(bucket, key)`. The codec
//! only touches it when an encoded value overflows the inline limit; the
//! session also uses it for `save`/`load`.
//!
//! Backends are dumb object stores. Content addressing, envelope parsing and
//! depth limits live in [`Codec`](crate::codec::Codec), not here.

pub mod memory;

use async_trait::async_trait;

use crate::error::BlobError;

/// Object storage addressed by bucket and key.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by every
/// concurrent dispatch task.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` at `bucket/key`, overwriting any existing object.
    ///
    /// # Errors
    ///
    /// - [`BlobError::Backend`] on I/O or backend-specific failures.
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), BlobError>;

    /// Fetches the object stored at `bucket/key`.
    ///
    /// # Errors
    ///
    /// - [`BlobError::NotFound`] if no object exists there.
    /// - [`BlobError::Backend`] on I/O or backend-specific failures.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;
}
