//! Fan code and data out across ephemeral serverless workers.
//!
//! `flock` takes a snippet of user code, an execution environment (runtime,
//! memory, timeout, dependency set) and a list of inputs, makes sure a pinned
//! remote artifact exists for that environment, and runs one remote
//! invocation per input in parallel. Results come back in input order no
//! matter how large they are: oversized payloads spill into a blob store and
//! are fetched back transparently.
//!
//! # Module Organization
//!
//! - [`alias`] - Environment specs and the deterministic alias fingerprint
//! - [`codec`] - Transport envelope (JSON + zlib + base64) with blob overflow
//! - [`blob`] - Blob store trait and the in-memory backend
//! - [`invoker`] - Remote backend trait and the scripted in-process backend
//! - [`registry`] - Concurrent known-alias registry and its state machine
//! - [`deploy`] - Deployment cache (`ensure_deployed`, removal, cleanup)
//! - [`dispatch`] - Bounded fan-out dispatcher and ordered result collection
//! - [`session`] - High-level entry point tying everything together
//! - [`error`] - Error types for every layer
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flock::artifact::ZipArtifactBuilder;
//! use flock::blob::memory::InMemoryBlobStore;
//! use flock::invoker::scripted::{ScriptedInvoker, ScriptedReply};
//! use flock::session::{PrepareOptions, Session};
//! use flock::FlockConfig;
//! use serde_json::{json, Map};
//!
//! # async fn example() -> flock::Result<()> {
//! let invoker = Arc::new(ScriptedInvoker::new("FlockLambda", |_event| {
//!     ScriptedReply::value(json!(42))
//! }));
//! let config = FlockConfig {
//!     bucket: Some("flock-demo".to_string()),
//!     ..FlockConfig::default()
//! };
//! let session = Session::new(
//!     config,
//!     invoker,
//!     Arc::new(InMemoryBlobStore::new()),
//!     Arc::new(ZipArtifactBuilder::new("main.py", b"# entrypoint".to_vec())),
//! )?;
//! session.start().await?;
//!
//! let spec = session.config().default_spec();
//! let run = session
//!     .prepare(spec, "INDEX * 2", &Map::new(), PrepareOptions::default())
//!     .await?;
//! let results = session.run_n(&run, 4).await;
//! assert_eq!(results.len(), 4);
//! # Ok(())
//! # }
//! ```

pub mod alias;
pub mod artifact;
pub mod blob;
pub mod capture;
pub mod codec;
pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod guidance;
pub mod invoker;
pub mod registry;
pub mod session;
pub mod syntax;

#[cfg(feature = "logging")]
pub mod logging;

pub use alias::{resolve, Alias, EnvironmentSpec};
pub use codec::{Codec, EncodedValue};
pub use config::FlockConfig;
pub use deploy::{CleanupReport, DeploymentCache};
pub use dispatch::{Dispatcher, InvocationResult, RunConfig};
pub use error::{FlockError, Result};
pub use session::Session;
