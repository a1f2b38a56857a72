//! Remote function backend.
//!
//! [`RemoteInvoker`] is the seam between the core and the serverless
//! platform. It covers request/response invocation plus the handful of
//! administrative calls the deployment cache needs: dry-run probes,
//! configuration updates, version publishing and alias management.
//!
//! All calls target one backend function; versions and aliases are the only
//! things that vary. [`scripted::ScriptedInvoker`] is an in-process
//! implementation used in tests and local runs. The AWS Lambda backend
//! lives in the `flock-aws` crate.

pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InvokeError;

/// The mutable, unpublished version every published version is cut from.
pub const BASELINE_VERSION: &str = "$LATEST";

/// Response of one request/response invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeOutput {
    /// Raw JSON response payload.
    pub payload: Vec<u8>,
    /// Decoded tail of the execution log, if the backend returned one.
    pub log_tail: Option<String>,
    /// Set when the function raised; the payload then holds an error
    /// envelope.
    pub function_error: Option<String>,
}

/// Source of code for a new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionCode {
    /// A zip archive uploaded inline.
    Zip(Vec<u8>),
    /// A zip archive previously written to the blob store.
    Blob { bucket: String, key: String },
}

/// Runtime settings applied to the baseline before publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfiguration {
    pub runtime: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    pub handler: String,
    #[serde(default)]
    pub layers: Vec<String>,
}

/// An alias and the version it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasInfo {
    pub name: String,
    pub version: String,
}

/// Serverless backend operations.
///
/// # Errors
///
/// Every method returns [`InvokeError::NotFound`] when the function, alias
/// or version it targets does not exist, and [`InvokeError::Transport`] for
/// anything else.
///
/// # Thread Safety
///
/// Implementations are shared as `Arc<dyn RemoteInvoker>` across all
/// dispatch tasks and must tolerate concurrent calls.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    /// Name of the backend function.
    fn function_name(&self) -> &str;

    /// Side-effect free existence check of the function, or of one of its
    /// aliases when `qualifier` is set.
    async fn probe(&self, qualifier: Option<&str>) -> Result<(), InvokeError>;

    /// Synchronous request/response invocation of `qualifier`, requesting
    /// the log tail.
    async fn invoke(&self, qualifier: &str, payload: Vec<u8>) -> Result<InvokeOutput, InvokeError>;

    /// Applies runtime settings to the baseline version.
    async fn update_configuration(&self, config: &FunctionConfiguration)
        -> Result<(), InvokeError>;

    /// Replaces the baseline code and publishes it, returning the new
    /// version identifier.
    async fn publish_version(&self, code: FunctionCode) -> Result<String, InvokeError>;

    /// Looks up an alias. A missing alias is `Ok(None)`.
    async fn get_alias(&self, name: &str) -> Result<Option<AliasInfo>, InvokeError>;

    /// Points `name` at `version`, creating the alias if needed.
    async fn put_alias(&self, name: &str, version: &str) -> Result<(), InvokeError>;

    async fn delete_alias(&self, name: &str) -> Result<(), InvokeError>;

    async fn delete_version(&self, version: &str) -> Result<(), InvokeError>;

    async fn list_aliases(&self) -> Result<Vec<AliasInfo>, InvokeError>;

    /// All versions, including [`BASELINE_VERSION`].
    async fn list_versions(&self) -> Result<Vec<String>, InvokeError>;
}
