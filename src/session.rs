//! High-level entry point.
//!
//! A [`Session`] wires configuration, the remote backend, the blob store,
//! the deployment cache and the dispatcher together, and keeps named run
//! configurations for reuse.
//!
//! Typical flow:
//!
//! 1. [`Session::start`] checks the backend function exists and loads the
//!    aliases already published on it.
//! 2. [`Session::prepare`] checks the code locally, deploys the environment
//!    if needed and captures referenced local values.
//! 3. [`Session::invoke`], [`Session::map`] or [`Session::run_n`] fan the
//!    prepared run out.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::alias::EnvironmentSpec;
use crate::artifact::ArtifactBuilder;
use crate::blob::BlobStore;
use crate::capture;
use crate::codec::{BlobContext, Codec};
use crate::config::FlockConfig;
use crate::deploy::{CleanupReport, DeploySettings, DeploymentCache};
use crate::dispatch::{Dispatcher, InvocationResult, RunConfig};
use crate::error::{FlockError, Result, SlotError};
use crate::syntax;

/// Flags controlling [`Session::prepare`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Skip deployment and assume the environment exists.
    pub no_install: bool,
    /// Remove the environment's alias and deploy it again.
    pub reinstall: bool,
    /// Surface platform lifecycle log lines.
    pub verbose: bool,
}

pub struct Session {
    config: FlockConfig,
    blob_store: Arc<dyn BlobStore>,
    bucket: Option<String>,
    cache: DeploymentCache,
    dispatcher: Dispatcher,
    stored: DashMap<String, RunConfig>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("stored", &self.stored.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Builds a session after validating `config`.
    pub fn new(
        config: FlockConfig,
        invoker: Arc<dyn crate::invoker::RemoteInvoker>,
        blob_store: Arc<dyn BlobStore>,
        artifacts: Arc<dyn ArtifactBuilder>,
    ) -> Result<Self> {
        config.validate()?;
        let bucket = config.blob_bucket();

        let mut codec = Codec::new().with_inline_limit(config.inline_limit);
        if let Some(bucket) = &bucket {
            codec = codec.with_blob_store(BlobContext::new(
                Arc::clone(&blob_store),
                bucket.clone(),
            ));
        }

        let cache = DeploymentCache::new(
            Arc::clone(&invoker),
            artifacts,
            DeploySettings {
                blob_bucket: bucket.clone(),
                build_prefix: config.build_prefix.clone(),
                handler: config.handler.clone(),
            },
        );
        let dispatcher =
            Dispatcher::new(invoker, codec).with_max_concurrency(config.max_concurrency);

        Ok(Self {
            config,
            blob_store,
            bucket,
            cache,
            dispatcher,
            stored: DashMap::new(),
        })
    }

    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    pub fn cache(&self) -> &DeploymentCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Checks the backend function and loads the published aliases.
    ///
    /// Returns the number of aliases found.
    pub async fn start(&self) -> Result<usize> {
        self.cache.check_backend().await?;
        let known = self.cache.refresh().await?;
        info!(
            function = %self.config.function_name,
            bucket = self.bucket.as_deref().unwrap_or("-"),
            known,
            "session started"
        );
        Ok(known)
    }

    /// Checks `code`, deploys `spec` as requested by `options`, and returns
    /// a run configuration carrying the `namespace` values `code` uses.
    pub async fn prepare(
        &self,
        spec: EnvironmentSpec,
        code: &str,
        namespace: &Map<String, Value>,
        options: PrepareOptions,
    ) -> Result<RunConfig> {
        syntax::check(code)?;

        let alias = if options.reinstall {
            self.cache.reinstall(&spec).await?
        } else if options.no_install {
            self.cache.resolve(&spec)
        } else {
            self.cache.ensure_deployed(&spec).await?
        };

        Ok(RunConfig {
            spec,
            alias,
            code: code.to_string(),
            globals: capture::select_globals(code, namespace),
            verbose: options.verbose,
        })
    }

    /// Stores `config` under `name`, replacing any previous entry.
    pub fn store(&self, name: impl Into<String>, config: RunConfig) {
        let name = name.into();
        info!(name = %name, alias = %config.alias, "stored run configuration");
        self.stored.insert(name, config);
    }

    pub fn stored(&self, name: &str) -> Result<RunConfig> {
        self.stored
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FlockError::UnknownConfig {
                name: name.to_string(),
            })
    }

    /// Runs `config` once on `data`.
    pub async fn invoke<T: Serialize>(&self, config: &RunConfig, data: &T) -> InvocationResult {
        self.map(config, std::slice::from_ref(data))
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                InvocationResult::failed(0, SlotError::Invoke("no result returned".to_string()))
            })
    }

    pub async fn invoke_named<T: Serialize>(
        &self,
        name: &str,
        data: &T,
    ) -> Result<InvocationResult> {
        let config = self.stored(name)?;
        Ok(self.invoke(&config, data).await)
    }

    /// Runs `config` once per input, results in input order.
    pub async fn map<T: Serialize>(
        &self,
        config: &RunConfig,
        inputs: &[T],
    ) -> Vec<InvocationResult> {
        self.dispatcher.run(config, inputs).await
    }

    pub async fn map_named<T: Serialize>(
        &self,
        name: &str,
        inputs: &[T],
    ) -> Result<Vec<InvocationResult>> {
        let config = self.stored(name)?;
        Ok(self.map(&config, inputs).await)
    }

    /// Runs `config` `n` times with inputs `0..n`.
    pub async fn run_n(&self, config: &RunConfig, n: usize) -> Vec<InvocationResult> {
        let inputs: Vec<usize> = (0..n).collect();
        self.map(config, &inputs).await
    }

    /// Removes the deployed environment for `spec`.
    pub async fn remove(&self, spec: &EnvironmentSpec) -> Result<bool> {
        Ok(self.cache.remove(spec).await?)
    }

    /// Removes every deployed environment.
    pub async fn clean(&self) -> Result<CleanupReport> {
        Ok(self.cache.remove_all().await?)
    }

    /// Writes `data` to `key` in the session bucket.
    pub async fn save(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let bucket = self.bucket.as_deref().ok_or(FlockError::NoBucket)?;
        self.blob_store.put(bucket, key, data).await?;
        Ok(())
    }

    /// Reads `key` from the session bucket.
    pub async fn load(&self, key: &str) -> Result<Vec<u8>> {
        let bucket = self.bucket.as_deref().ok_or(FlockError::NoBucket)?;
        Ok(self.blob_store.get(bucket, key).await?)
    }
}
