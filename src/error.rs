//! Error types for every layer of the crate.
//!
//! Each subsystem has its own enum so callers can match on what actually
//! went wrong; [`FlockError`] wraps them all for the high-level
//! [`Session`](crate::session::Session) API.

use thiserror::Error;

use crate::registry::AliasState;

/// Result type used by the high-level API.
pub type Result<T, E = FlockError> = std::result::Result<T, E>;

/// Top-level error for session operations.
#[derive(Debug, Error)]
pub enum FlockError {
    /// The submitted code failed the local pre-flight check.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// Building or publishing an environment failed.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// Encoding or decoding a transport envelope failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A blob store call failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Blob storage was needed but no bucket is configured.
    #[error("no blob bucket configured; set `bucket` or `account_id`")]
    NoBucket,

    /// No run configuration has been stored under this name.
    #[error("no stored run configuration named '{name}'")]
    UnknownConfig { name: String },
}

/// Local syntax check failure for user code.
///
/// Carries only the position and a short message; no internal frames are
/// ever attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    /// 1-based line of the offending character.
    pub line: usize,
    /// 1-based column of the offending character.
    pub column: usize,
    /// What the checker found.
    pub message: String,
}

/// Errors raised while making sure an environment is deployed.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The bootstrap environment reported an error while installing
    /// dependencies.
    #[error("dependency build for '{alias}' failed: {error_type}: {message}")]
    BuildFailed {
        alias: String,
        error_type: String,
        message: String,
    },

    /// An administrative backend call failed.
    #[error("backend call failed for '{target}': {source}")]
    Backend {
        /// Alias or function the call was about.
        target: String,
        #[source]
        source: InvokeError,
    },

    /// Dependency builds upload their package to the blob store, which is
    /// not configured.
    #[error("'{alias}' has dependencies but no blob bucket is configured for the build")]
    MissingBucket { alias: String },

    /// The unqualified backend function does not exist.
    #[error("backend function '{function}' does not exist")]
    BackendMissing { function: String },

    /// Packaging the minimal artifact failed.
    #[error("failed to package artifact: {message}")]
    Package { message: String },

    /// A build event or response could not be (de)serialized.
    #[error("malformed build payload for '{alias}': {source}")]
    Payload {
        alias: String,
        #[source]
        source: serde_json::Error,
    },

    /// The alias registry rejected a state change.
    #[error("invalid alias transition from {from} to {to} for '{alias}'")]
    InvalidTransition {
        alias: String,
        from: AliasState,
        to: AliasState,
    },
}

/// Errors from the transport codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The encoded envelope is larger than the inline limit and no blob
    /// store is available to spill it into.
    #[error(
        "encoded value is {size} bytes, over the {limit} byte inline limit, \
         and no blob store is configured"
    )]
    Overflow { size: usize, limit: usize },

    /// The value could not be serialized or the payload could not be parsed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    /// The inline data is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Fetching or storing a spilled envelope failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// A blob pointer was found but no blob store is configured.
    #[error("value stored at {bucket}/{key} but no blob store is configured")]
    NoBlobStore { bucket: String, key: String },

    /// Blob pointers chained deeper than the decoder allows.
    #[error("blob pointers nested deeper than {max} levels")]
    TooDeep { max: usize },
}

/// Errors from a [`BlobStore`](crate::blob::BlobStore).
#[derive(Debug, Error)]
pub enum BlobError {
    /// No object exists at the given location.
    #[error("blob not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// An I/O or backend-specific error occurred.
    #[error("blob backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors from a [`RemoteInvoker`](crate::invoker::RemoteInvoker).
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The function, alias or version does not exist.
    #[error("remote function not found: {target}")]
    NotFound { target: String },

    /// Transport, throttling or other backend failure.
    #[error("remote backend error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl InvokeError {
    /// Builds a [`InvokeError::Transport`] without an underlying source.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("failed to access config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config parsed but holds unusable values.
    #[error("config validation error: {message}")]
    Invalid { message: String },
}

/// Per-slot failure of a single fan-out invocation.
///
/// A slot error never aborts sibling invocations; it is carried in the
/// corresponding [`InvocationResult`](crate::dispatch::InvocationResult).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SlotError {
    /// The user code raised inside the remote worker.
    #[error("{error_type}: {message}")]
    Remote {
        error_type: String,
        message: String,
        /// Targeted guidance, e.g. a missing dependency.
        hint: Option<String>,
    },

    /// The remote call itself failed (network, throttling, missing alias).
    #[error("invocation failed: {0}")]
    Invoke(String),

    /// The input could not be encoded for transport.
    #[error("could not encode input: {0}")]
    Encode(String),

    /// The result envelope could not be decoded.
    #[error("could not decode result: {0}")]
    Decode(String),

    /// The response did not match any known shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SlotError {
    /// Short category name, for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote { .. } => "remote",
            Self::Invoke(_) => "invoke",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::Malformed(_) => "malformed",
        }
    }
}
