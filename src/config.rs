//! Session configuration.
//!
//! Loaded from a TOML file (missing file means defaults), then overridden
//! by `FLOCK_*` environment variables:
//!
//! ```toml
//! function_name = "FlockLambda"
//! bucket = "flock-123456789012"
//! region = "us-west-2"
//! memory_mb = 1024
//! max_concurrency = 200
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::alias::EnvironmentSpec;
use crate::codec::DEFAULT_INLINE_LIMIT;
use crate::error::ConfigError;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "FLOCK_";

/// Memory bounds accepted by the backend, in MB.
pub const MEMORY_RANGE_MB: std::ops::RangeInclusive<u32> = 128..=10240;

/// Timeout bounds accepted by the backend, in seconds.
pub const TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u32> = 1..=900;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockConfig {
    /// Backend function every alias is published on.
    pub function_name: String,
    /// Blob bucket. When unset it is derived from `bucket_prefix` and
    /// `account_id`.
    pub bucket: Option<String>,
    pub bucket_prefix: String,
    pub account_id: Option<String>,
    /// Credentials profile for the cloud SDK.
    pub profile: Option<String>,
    pub region: Option<String>,

    pub runtime: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,

    /// Maximum in-flight invocations per fan-out.
    pub max_concurrency: usize,
    /// Longest inline envelope, in bytes of base64 text.
    pub inline_limit: usize,

    /// Key prefix the bootstrap environment uploads built packages under.
    pub build_prefix: String,
    /// File name of the remote entrypoint inside minimal packages.
    pub entrypoint: String,
    pub handler: String,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            function_name: "FlockLambda".to_string(),
            bucket: None,
            bucket_prefix: "flock-".to_string(),
            account_id: None,
            profile: None,
            region: None,
            runtime: "python3.7".to_string(),
            memory_mb: 512,
            timeout_secs: 60,
            max_concurrency: 1000,
            inline_limit: DEFAULT_INLINE_LIMIT,
            build_prefix: "builds/".to_string(),
            entrypoint: "main.py".to_string(),
            handler: "main.lambda_handler".to_string(),
        }
    }
}

impl FlockConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Applies `FLOCK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Applies `FLOCK_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("FUNCTION_NAME") {
            self.function_name = v;
        }
        if let Some(v) = var("BUCKET") {
            self.bucket = Some(v);
        }
        if let Some(v) = var("BUCKET_PREFIX") {
            self.bucket_prefix = v;
        }
        if let Some(v) = var("ACCOUNT_ID") {
            self.account_id = Some(v);
        }
        if let Some(v) = var("PROFILE") {
            self.profile = Some(v);
        }
        if let Some(v) = var("REGION") {
            self.region = Some(v);
        }
        if let Some(v) = var("RUNTIME") {
            self.runtime = v;
        }
        if let Some(v) = var("MEMORY_MB") {
            self.memory_mb = parse_var("MEMORY_MB", &v)?;
        }
        if let Some(v) = var("TIMEOUT_SECS") {
            self.timeout_secs = parse_var("TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("INLINE_LIMIT") {
            self.inline_limit = parse_var("INLINE_LIMIT", &v)?;
        }
        Ok(())
    }

    /// Rejects values the backend or the dispatcher cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.function_name.trim().is_empty() {
            return Err(invalid("function_name must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.inline_limit == 0 {
            return Err(invalid("inline_limit must be at least 1"));
        }
        if !MEMORY_RANGE_MB.contains(&self.memory_mb) {
            return Err(invalid(format!(
                "memory_mb {} is outside {}..={}",
                self.memory_mb,
                MEMORY_RANGE_MB.start(),
                MEMORY_RANGE_MB.end()
            )));
        }
        if !TIMEOUT_RANGE_SECS.contains(&self.timeout_secs) {
            return Err(invalid(format!(
                "timeout_secs {} is outside {}..={}",
                self.timeout_secs,
                TIMEOUT_RANGE_SECS.start(),
                TIMEOUT_RANGE_SECS.end()
            )));
        }
        Ok(())
    }

    /// Bucket used for overflow, builds and `save`/`load`.
    pub fn blob_bucket(&self) -> Option<String> {
        self.bucket.clone().or_else(|| {
            self.account_id
                .as_ref()
                .map(|account| format!("{}{}", self.bucket_prefix, account))
        })
    }

    /// Dependency-free spec with the configured runtime, memory and timeout.
    pub fn default_spec(&self) -> EnvironmentSpec {
        EnvironmentSpec::new(self.runtime.clone(), self.memory_mb, self.timeout_secs)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        invalid(format!(
            "{ENV_PREFIX}{name} must be a number, got '{value}'"
        ))
    })
}
