//! S3 blob store.
//!
//! Buckets are not created here; the session bucket must already exist and
//! be readable by the backend function's execution role.

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::trace;

use flock::blob::BlobStore;
use flock::error::BlobError;

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the standard AWS config chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

fn backend_error<E>(err: E, what: &str) -> BlobError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BlobError::Backend {
        message: format!("S3 {what} failed: {}", DisplayErrorContext(&err)),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        trace!(bucket, key, bytes = data.len(), "put object");
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend_error(e, "put_object"))?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        trace!(bucket, key, "get object");
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                return Err(BlobError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(backend_error(err, "get_object")),
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| backend_error(e, "body read"))?
            .into_bytes();
        Ok(bytes.to_vec())
    }
}
