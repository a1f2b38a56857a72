//! AWS backends for `flock`.
//!
//! [`lambda::LambdaInvoker`] runs invocations and manages aliases on one
//! Lambda function; [`s3::S3BlobStore`] holds spilled envelopes, built
//! dependency packages and saved artifacts. [`AwsBackend::connect`] builds
//! both from a [`FlockConfig`], honouring its `profile` and `region`.
//!
//! ```rust,no_run
//! use flock::FlockConfig;
//! use flock_aws::AwsBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = FlockConfig::load("flock.toml")?;
//! config.apply_env()?;
//! let backend = AwsBackend::connect(&config).await;
//! let session = backend.session(config, std::fs::read("main.py")?)?;
//! session.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod lambda;
pub mod s3;

use std::sync::Arc;

use aws_config::BehaviorVersion;
use tracing::debug;

use flock::artifact::ZipArtifactBuilder;
use flock::{FlockConfig, Session};

pub use lambda::LambdaInvoker;
pub use s3::S3BlobStore;

/// Lambda invoker and S3 store sharing one SDK configuration.
#[derive(Debug, Clone)]
pub struct AwsBackend {
    invoker: Arc<LambdaInvoker>,
    blobs: Arc<S3BlobStore>,
}

impl AwsBackend {
    /// Loads AWS configuration, applying `config.profile` and
    /// `config.region` over the default provider chain.
    pub async fn connect(config: &FlockConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;
        debug!(
            function = %config.function_name,
            region = ?sdk_config.region(),
            "loaded AWS configuration"
        );

        Self {
            invoker: Arc::new(LambdaInvoker::new(
                aws_sdk_lambda::Client::new(&sdk_config),
                config.function_name.clone(),
            )),
            blobs: Arc::new(S3BlobStore::new(aws_sdk_s3::Client::new(&sdk_config))),
        }
    }

    pub fn invoker(&self) -> Arc<LambdaInvoker> {
        Arc::clone(&self.invoker)
    }

    pub fn blob_store(&self) -> Arc<S3BlobStore> {
        Arc::clone(&self.blobs)
    }

    /// Builds a session whose minimal packages hold `entrypoint_source`
    /// under `config.entrypoint`.
    pub fn session(
        &self,
        config: FlockConfig,
        entrypoint_source: Vec<u8>,
    ) -> flock::Result<Session> {
        let artifacts = Arc::new(ZipArtifactBuilder::new(
            config.entrypoint.clone(),
            entrypoint_source,
        ));
        Session::new(config, self.invoker(), self.blob_store(), artifacts)
    }
}
