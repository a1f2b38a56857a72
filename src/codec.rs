//! Transport codec for values crossing the remote boundary.
//!
//! Values are serialized to JSON, zlib-compressed and base64-encoded into an
//! [`EncodedValue::Inline`] envelope. When that envelope is longer than the
//! inline limit and a blob store is configured, the envelope itself is
//! stored content-addressed under `chunks/<sha256>` and replaced by an
//! [`EncodedValue::Blob`] pointer.
//!
//! Wire shape:
//!
//! ```json
//! {"type": "inline", "data": "eJyLjgUAARUAuQ=="}
//! {"type": "blob", "bucket": "flock-123", "key": "chunks/9f86d0..."}
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::blob::BlobStore;
use crate::error::CodecError;

/// Default inline limit: 5 MiB of base64 text.
pub const DEFAULT_INLINE_LIMIT: usize = 5 * 1024 * 1024;

/// Maximum number of blob pointers followed while decoding one value.
pub const MAX_BLOB_DEPTH: usize = 4;

/// Key prefix for spilled envelopes.
pub const CHUNK_PREFIX: &str = "chunks/";

/// A value ready for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncodedValue {
    /// Base64 of the zlib-compressed JSON serialization.
    Inline { data: String },
    /// Pointer to a stored envelope.
    Blob { bucket: String, key: String },
}

impl EncodedValue {
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

/// Blob store plus the bucket overflow is written to.
#[derive(Clone)]
pub struct BlobContext {
    pub store: Arc<dyn BlobStore>,
    pub bucket: String,
}

impl BlobContext {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

impl std::fmt::Debug for BlobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobContext")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Encoder/decoder for [`EncodedValue`]s.
///
/// Cheap to clone; the blob store is shared.
#[derive(Debug, Clone)]
pub struct Codec {
    inline_limit: usize,
    blob: Option<BlobContext>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// A codec with the default inline limit and no blob store.
    pub fn new() -> Self {
        Self {
            inline_limit: DEFAULT_INLINE_LIMIT,
            blob: None,
        }
    }

    #[must_use]
    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    /// Enables spilling oversized envelopes into `ctx`.
    #[must_use]
    pub fn with_blob_store(mut self, ctx: BlobContext) -> Self {
        self.blob = Some(ctx);
        self
    }

    pub fn inline_limit(&self) -> usize {
        self.inline_limit
    }

    /// Bucket overflow is written to, if any.
    pub fn blob_bucket(&self) -> Option<&str> {
        self.blob.as_ref().map(|ctx| ctx.bucket.as_str())
    }

    /// Encodes `value` inline, ignoring the size limit.
    pub fn encode_inline<T: Serialize + ?Sized>(value: &T) -> Result<EncodedValue, CodecError> {
        let json = serde_json::to_vec(value)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(EncodedValue::Inline {
            data: BASE64_STANDARD.encode(compressed),
        })
    }

    /// Decodes an inline envelope without touching the blob store.
    pub fn decode_inline<T: DeserializeOwned>(value: &EncodedValue) -> Result<T, CodecError> {
        match value {
            EncodedValue::Inline { data } => decode_inline(data),
            EncodedValue::Blob { bucket, key } => Err(CodecError::NoBlobStore {
                bucket: bucket.clone(),
                key: key.clone(),
            }),
        }
    }

    /// Encodes `value`, spilling to the blob store when the inline envelope
    /// is longer than the limit.
    ///
    /// # Errors
    ///
    /// [`CodecError::Overflow`] when the value is too large and no blob store
    /// is configured. Callers that must not fail degrade this to a null
    /// placeholder.
    pub async fn encode<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<EncodedValue, CodecError> {
        let inline = Self::encode_inline(value)?;
        let size = match &inline {
            EncodedValue::Inline { data } => data.len(),
            EncodedValue::Blob { .. } => 0,
        };
        if size <= self.inline_limit {
            return Ok(inline);
        }

        let Some(ctx) = &self.blob else {
            return Err(CodecError::Overflow {
                size,
                limit: self.inline_limit,
            });
        };

        let envelope = serde_json::to_vec(&inline)?;
        let key = format!("{CHUNK_PREFIX}{}", hex::encode(Sha256::digest(&envelope)));
        debug!(bucket = %ctx.bucket, key = %key, size, "spilling encoded value to blob store");
        ctx.store.put(&ctx.bucket, &key, envelope).await?;
        Ok(EncodedValue::Blob {
            bucket: ctx.bucket.clone(),
            key,
        })
    }

    /// Decodes `value`, following up to [`MAX_BLOB_DEPTH`] blob pointers.
    pub async fn decode<T: DeserializeOwned>(&self, value: &EncodedValue) -> Result<T, CodecError> {
        let mut current = value.clone();
        let mut depth = 0;
        loop {
            match current {
                EncodedValue::Inline { data } => return decode_inline(&data),
                EncodedValue::Blob { bucket, key } => {
                    depth += 1;
                    if depth > MAX_BLOB_DEPTH {
                        return Err(CodecError::TooDeep {
                            max: MAX_BLOB_DEPTH,
                        });
                    }
                    let Some(ctx) = &self.blob else {
                        return Err(CodecError::NoBlobStore { bucket, key });
                    };
                    debug!(bucket = %bucket, key = %key, depth, "fetching spilled value");
                    let bytes = ctx.store.get(&bucket, &key).await?;
                    current = serde_json::from_slice(&bytes)?;
                }
            }
        }
    }
}

fn decode_inline<T: DeserializeOwned>(data: &str) -> Result<T, CodecError> {
    let compressed = BASE64_STANDARD.decode(data)?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
