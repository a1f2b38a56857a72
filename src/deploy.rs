//! Content-addressed deployment cache.
//!
//! [`DeploymentCache::ensure_deployed`] guarantees that a pinned, published
//! artifact exists for an [`EnvironmentSpec`] before anything is dispatched
//! to it. The alias derived from the environment is the cache key; the
//! backend is the cache storage, and the [`AliasRegistry`] remembers which
//! aliases are known so repeated runs skip the existence probe.
//!
//! # Deploy Paths
//!
//! - **No dependencies**: package the entrypoint into a minimal zip, apply
//!   the environment's runtime settings, publish a version from the zip
//!   and bind the alias to it.
//! - **With dependencies**: make sure the bootstrap environment exists, send
//!   it a BUILD event that installs the requirements and uploads a package
//!   to the blob store, then apply settings, publish from the uploaded
//!   object and bind the alias. Each environment's package has its own key
//!   under [`DeploySettings::build_prefix`], so concurrent builds never
//!   publish each other's packages.
//!
//! # Concurrency
//!
//! Callers racing on the same alias are serialized on a per-alias lock, so
//! the build and publish sequence runs at most once. Builds for different
//! aliases run in parallel. All publishes share one lock: configure, publish
//! and bind mutate the single function's baseline and must not interleave.
//!
//! # Aliases
//!
//! The cache mixes a digest of its entrypoint and handler into every alias
//! (see [`DeploymentCache::resolve`]). Artifacts published with a different
//! entrypoint are never probed or reused.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alias::{self, digest_parts, fingerprint, Alias, EnvironmentSpec};
use crate::artifact::ArtifactBuilder;
use crate::error::{DeployError, InvokeError};
use crate::events::{parse_reply, surface_log_lines, BuildEvent, BuildReply, Event, Reply};
use crate::invoker::{FunctionCode, FunctionConfiguration, RemoteInvoker, BASELINE_VERSION};
use crate::registry::{AliasRegistry, AliasState};

/// Backend-facing settings of a [`DeploymentCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySettings {
    /// Bucket dependency builds upload packages to.
    pub blob_bucket: Option<String>,
    /// Key prefix of built packages. Each environment uploads to
    /// `<prefix><runtime>/<fingerprint>.zip`.
    pub build_prefix: String,
    /// Entrypoint handler applied with every configuration.
    pub handler: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            blob_bucket: None,
            build_prefix: "builds/".to_string(),
            handler: "main.lambda_handler".to_string(),
        }
    }
}

/// Counts reported by [`DeploymentCache::remove_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub aliases_removed: usize,
    pub versions_removed: usize,
}

pub struct DeploymentCache {
    invoker: Arc<dyn RemoteInvoker>,
    artifacts: Arc<dyn ArtifactBuilder>,
    registry: Arc<AliasRegistry>,
    settings: DeploySettings,
    entrypoint: String,
    alias_locks: DashMap<Alias, Arc<Mutex<()>>>,
    publish_lock: Mutex<()>,
}

impl std::fmt::Debug for DeploymentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentCache")
            .field("function", &self.invoker.function_name())
            .field("settings", &self.settings)
            .field("entrypoint", &self.entrypoint)
            .field("known_aliases", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DeploymentCache {
    pub fn new(
        invoker: Arc<dyn RemoteInvoker>,
        artifacts: Arc<dyn ArtifactBuilder>,
        settings: DeploySettings,
    ) -> Self {
        let entrypoint = digest_parts(&[
            artifacts.fingerprint().as_bytes(),
            settings.handler.as_bytes(),
        ]);
        Self {
            invoker,
            artifacts,
            registry: Arc::new(AliasRegistry::new()),
            settings,
            entrypoint,
            alias_locks: DashMap::new(),
            publish_lock: Mutex::new(()),
        }
    }

    /// Uses `registry` instead of a private one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<AliasRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<AliasRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// Digest of the entrypoint and handler this cache deploys.
    pub fn entrypoint_digest(&self) -> &str {
        &self.entrypoint
    }

    /// Alias `spec` resolves to when deployed by this cache.
    pub fn resolve(&self, spec: &EnvironmentSpec) -> Alias {
        alias::resolve(spec, &self.entrypoint)
    }

    /// Blob key the dependency build for `spec` uploads its package to.
    pub fn package_key(&self, spec: &EnvironmentSpec) -> String {
        let hash = fingerprint(
            &self.entrypoint,
            &spec.normalized_dependencies(),
            &spec.normalized_extensions(),
        );
        format!("{}{}/{}.zip", self.settings.build_prefix, spec.runtime(), hash)
    }

    /// Makes sure `spec` is deployed and returns its alias.
    ///
    /// Idempotent and safe to call concurrently.
    ///
    /// # Errors
    ///
    /// - [`DeployError::BuildFailed`] when the dependency build reports an
    ///   error.
    /// - [`DeployError::Backend`] when a probe, publish or alias call fails.
    pub async fn ensure_deployed(&self, spec: &EnvironmentSpec) -> Result<Alias, DeployError> {
        let alias = self.resolve(spec);
        let target = &alias;
        self.ensure_with(target, move || async move {
            if spec.needs_build() {
                let bootstrap = self.ensure_bootstrap(spec.runtime()).await?;
                self.deploy_built(target, spec, &bootstrap).await
            } else {
                self.deploy_minimal(target, spec).await
            }
        })
        .await?;
        Ok(alias)
    }

    /// Deploys the bootstrap environment for `runtime`.
    ///
    /// The bootstrap spec has no dependencies, so this only ever takes the
    /// minimal path.
    async fn ensure_bootstrap(&self, runtime: &str) -> Result<Alias, DeployError> {
        let spec = EnvironmentSpec::bootstrap(runtime);
        let alias = self.resolve(&spec);
        let (target, spec) = (&alias, &spec);
        self.ensure_with(target, move || self.deploy_minimal(target, spec))
            .await?;
        Ok(alias)
    }

    async fn ensure_with<F, Fut>(&self, alias: &Alias, deploy: F) -> Result<(), DeployError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DeployError>>,
    {
        if self.registry.is_deployed(alias) {
            return Ok(());
        }

        let lock = self.alias_lock(alias);
        let _guard = lock.lock().await;
        if self.registry.is_deployed(alias) {
            return Ok(());
        }

        self.registry.transition(alias, AliasState::Probing)?;
        match self.invoker.probe(Some(alias.as_str())).await {
            Ok(()) => {
                debug!(alias = %alias, "alias already published");
                self.registry.transition(alias, AliasState::ProbeFound)?;
                self.registry.transition(alias, AliasState::Deployed)?;
                return Ok(());
            }
            Err(InvokeError::NotFound { .. }) => {
                debug!(alias = %alias, "probe missed, deploying");
            }
            Err(source) => {
                self.registry.forget(alias);
                return Err(DeployError::Backend {
                    target: alias.to_string(),
                    source,
                });
            }
        }

        self.registry.transition(alias, AliasState::Deploying)?;
        match deploy().await {
            Ok(()) => {
                self.registry.transition(alias, AliasState::Deployed)?;
                info!(alias = %alias, "successfully deployed");
                Ok(())
            }
            Err(err) => {
                self.registry.forget(alias);
                warn!(alias = %alias, error = %err, "deployment failed");
                Err(err)
            }
        }
    }

    fn alias_lock(&self, alias: &Alias) -> Arc<Mutex<()>> {
        self.alias_locks
            .entry(alias.clone())
            .or_default()
            .value()
            .clone()
    }

    fn configuration(&self, spec: &EnvironmentSpec) -> FunctionConfiguration {
        FunctionConfiguration {
            runtime: spec.runtime().to_string(),
            memory_mb: spec.memory_mb(),
            timeout_secs: spec.timeout_secs(),
            handler: self.settings.handler.clone(),
            layers: spec.extensions().iter().cloned().collect(),
        }
    }

    /// Configures the baseline, publishes `code` and binds `alias`.
    async fn publish(
        &self,
        alias: &Alias,
        spec: &EnvironmentSpec,
        code: FunctionCode,
    ) -> Result<(), DeployError> {
        let backend = |source| DeployError::Backend {
            target: alias.to_string(),
            source,
        };

        let _publish = self.publish_lock.lock().await;
        if !spec.extensions().is_empty() {
            info!(alias = %alias, layers = spec.extensions().len(), "installing layers");
        }
        self.invoker
            .update_configuration(&self.configuration(spec))
            .await
            .map_err(backend)?;
        let version = self.invoker.publish_version(code).await.map_err(backend)?;
        self.invoker
            .put_alias(alias.as_str(), &version)
            .await
            .map_err(backend)?;
        debug!(alias = %alias, version = %version, "alias bound");
        Ok(())
    }

    async fn deploy_minimal(
        &self,
        alias: &Alias,
        spec: &EnvironmentSpec,
    ) -> Result<(), DeployError> {
        let package = self.artifacts.minimal_package()?;
        self.publish(alias, spec, FunctionCode::Zip(package)).await
    }

    async fn deploy_built(
        &self,
        alias: &Alias,
        spec: &EnvironmentSpec,
        bootstrap: &Alias,
    ) -> Result<(), DeployError> {
        let bucket = self
            .settings
            .blob_bucket
            .clone()
            .ok_or_else(|| DeployError::MissingBucket {
                alias: alias.to_string(),
            })?;
        let key = self.package_key(spec);
        let event = Event::Build(BuildEvent {
            requirements: spec.dependencies().iter().cloned().collect(),
            blob_bucket: bucket.clone(),
            blob_key: key.clone(),
        });
        let payload = serde_json::to_vec(&event).map_err(|source| DeployError::Payload {
            alias: alias.to_string(),
            source,
        })?;

        info!(
            alias = %alias,
            bootstrap = %bootstrap,
            key = %key,
            "installing dependencies (this will take a while)"
        );
        let output = self
            .invoker
            .invoke(bootstrap.as_str(), payload)
            .await
            .map_err(|source| DeployError::Backend {
                target: bootstrap.to_string(),
                source,
            })?;
        if let Some(tail) = &output.log_tail {
            for line in surface_log_lines(tail, false) {
                debug!(target: "flock::remote", alias = %bootstrap, "{line}");
            }
        }

        let reply = parse_reply::<BuildReply>(&output.payload, output.function_error.as_deref())
            .map_err(|source| DeployError::Payload {
                alias: alias.to_string(),
                source,
            })?;
        if let Reply::Error(err) = reply {
            return Err(DeployError::BuildFailed {
                alias: alias.to_string(),
                error_type: err.error_type,
                message: err.message,
            });
        }

        self.publish(alias, spec, FunctionCode::Blob { bucket, key }).await
    }

    /// Deletes the alias for `spec` and the version it points at.
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove(&self, spec: &EnvironmentSpec) -> Result<bool, DeployError> {
        let alias = self.resolve(spec);
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let backend = |source| DeployError::Backend {
            target: alias.to_string(),
            source,
        };

        let bound = self
            .invoker
            .get_alias(alias.as_str())
            .await
            .map_err(backend)?;
        self.registry.forget(&alias);
        let Some(bound) = bound else {
            debug!(alias = %alias, "nothing to remove");
            return Ok(false);
        };

        ignore_missing(self.invoker.delete_alias(&bound.name).await).map_err(backend)?;
        ignore_missing(self.invoker.delete_version(&bound.version).await).map_err(backend)?;
        info!(alias = %alias, version = %bound.version, "deleted alias");
        Ok(true)
    }

    /// Removes and redeploys `spec`.
    pub async fn reinstall(&self, spec: &EnvironmentSpec) -> Result<Alias, DeployError> {
        self.remove(spec).await?;
        self.ensure_deployed(spec).await
    }

    /// Deletes every alias and every published version, keeping only the
    /// baseline.
    pub async fn remove_all(&self) -> Result<CleanupReport, DeployError> {
        let function = self.invoker.function_name().to_string();
        let backend = |source| DeployError::Backend {
            target: function.clone(),
            source,
        };

        let _publish = self.publish_lock.lock().await;
        let mut report = CleanupReport::default();

        for alias in self.invoker.list_aliases().await.map_err(backend)? {
            ignore_missing(self.invoker.delete_alias(&alias.name).await).map_err(backend)?;
            report.aliases_removed += 1;
        }
        for version in self.invoker.list_versions().await.map_err(backend)? {
            if version == BASELINE_VERSION {
                continue;
            }
            ignore_missing(self.invoker.delete_version(&version).await).map_err(backend)?;
            report.versions_removed += 1;
        }

        self.registry.clear();
        info!(
            aliases = report.aliases_removed,
            versions = report.versions_removed,
            "removed {} aliases, and {} versions",
            report.aliases_removed,
            report.versions_removed
        );
        Ok(report)
    }

    /// Reloads the registry from the backend's alias listing.
    pub async fn refresh(&self) -> Result<usize, DeployError> {
        let aliases = self
            .invoker
            .list_aliases()
            .await
            .map_err(|source| DeployError::Backend {
                target: self.invoker.function_name().to_string(),
                source,
            })?;
        let count = aliases.len();
        self.registry
            .replace_all(aliases.into_iter().map(|a| Alias::from_backend(a.name)));
        debug!(count, "alias registry refreshed");
        Ok(count)
    }

    /// Verifies the backend function exists.
    pub async fn check_backend(&self) -> Result<(), DeployError> {
        let function = self.invoker.function_name().to_string();
        match self.invoker.probe(None).await {
            Ok(()) => Ok(()),
            Err(InvokeError::NotFound { .. }) => Err(DeployError::BackendMissing { function }),
            Err(source) => Err(DeployError::Backend {
                target: function,
                source,
            }),
        }
    }
}

fn ignore_missing(result: Result<(), InvokeError>) -> Result<(), InvokeError> {
    match result {
        Err(InvokeError::NotFound { .. }) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ZipArtifactBuilder;
    use crate::invoker::scripted::{ScriptedInvoker, ScriptedReply};

    fn cache(invoker: Arc<ScriptedInvoker>) -> DeploymentCache {
        DeploymentCache::new(
            invoker,
            Arc::new(ZipArtifactBuilder::new("main.py", b"# entry".to_vec())),
            DeploySettings {
                blob_bucket: Some("bucket".to_string()),
                ..DeploySettings::default()
            },
        )
    }

    fn invoker() -> Arc<ScriptedInvoker> {
        Arc::new(ScriptedInvoker::new("fn", |_| ScriptedReply::value(0)))
    }

    fn missing_function() -> ScriptedInvoker {
        ScriptedInvoker::new("fn", |_| ScriptedReply::value(0)).without_function()
    }

    #[tokio::test]
    async fn known_alias_skips_probe() {
        let invoker = invoker();
        let cache = cache(invoker.clone());
        let spec = EnvironmentSpec::new("python3.7", 512, 60);
        cache.ensure_deployed(&spec).await.unwrap();
        let probes = invoker.probe_count();
        cache.ensure_deployed(&spec).await.unwrap();
        assert_eq!(invoker.probe_count(), probes);
    }

    #[tokio::test]
    async fn failed_deploy_resets_state() {
        let invoker = Arc::new(missing_function());
        let cache = cache(invoker);
        let spec = EnvironmentSpec::new("python3.7", 512, 60);
        let alias = cache.resolve(&spec);
        assert!(cache.ensure_deployed(&spec).await.is_err());
        assert_eq!(cache.registry().state(&alias), AliasState::Unknown);
    }

    #[tokio::test]
    async fn missing_bucket_is_reported() {
        let invoker = invoker();
        let cache = DeploymentCache::new(
            invoker,
            Arc::new(ZipArtifactBuilder::new("main.py", Vec::new())),
            DeploySettings::default(),
        );
        let spec = EnvironmentSpec::new("python3.7", 512, 60).with_dependencies(["numpy"]);
        let err = cache.ensure_deployed(&spec).await.unwrap_err();
        assert!(matches!(err, DeployError::MissingBucket { .. }));
    }

    #[test]
    fn handler_feeds_the_alias() {
        let spec = EnvironmentSpec::new("python3.7", 512, 60);
        let other = DeploymentCache::new(
            invoker(),
            Arc::new(ZipArtifactBuilder::new("main.py", b"# entry".to_vec())),
            DeploySettings {
                handler: "main.other_handler".to_string(),
                ..DeploySettings::default()
            },
        );
        assert_ne!(cache(invoker()).resolve(&spec), other.resolve(&spec));
    }

    #[test]
    fn package_keys_are_per_environment() {
        let cache = cache(invoker());
        let numpy = EnvironmentSpec::new("python3.7", 512, 60).with_dependencies(["numpy"]);
        let pandas = EnvironmentSpec::new("python3.7", 512, 60).with_dependencies(["pandas"]);

        let key = cache.package_key(&numpy);
        assert!(key.starts_with("builds/python3.7/"));
        assert!(key.ends_with(".zip"));
        assert_ne!(key, cache.package_key(&pandas));
        assert_eq!(key, cache.package_key(&numpy.clone().with_dependencies(["NumPy"])));
    }

    #[tokio::test]
    async fn check_backend_reports_missing_function() {
        let invoker = Arc::new(missing_function());
        let err = cache(invoker).check_backend().await.unwrap_err();
        assert!(matches!(err, DeployError::BackendMissing { function } if function == "fn"));
    }
}
