//! In-process [`RemoteInvoker`] driven by closures.
//!
//! [`ScriptedInvoker`] models one backend function with a mutable baseline,
//! numbered published versions and aliases. RUN events are answered by a
//! user-supplied handler; BUILD events by an optional build handler that
//! succeeds by default. Every call is counted so tests can assert how often
//! the deployment cache actually built or published.
//!
//! # Examples
//!
//! ```
//! use flock::invoker::scripted::{ScriptedInvoker, ScriptedReply};
//! use serde_json::json;
//!
//! let invoker = ScriptedInvoker::new("FlockLambda", |call| {
//!     let input: i64 = call.input().unwrap_or_default();
//!     ScriptedReply::value(json!(input + call.index() as i64))
//! });
//! assert_eq!(invoker.publish_count(), 0);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::{
    AliasInfo, FunctionCode, FunctionConfiguration, InvokeOutput, RemoteInvoker,
    BASELINE_VERSION,
};
use crate::blob::BlobStore;
use crate::codec::{Codec, EncodedValue};
use crate::error::{CodecError, InvokeError};
use crate::events::{BuildEvent, Event, RunEvent};

type RunHandler = dyn Fn(&RunCall) -> ScriptedReply + Send + Sync;
type BuildHandler = dyn Fn(&BuildEvent) -> ScriptedReply + Send + Sync;

/// A RUN event as seen by a scripted handler.
#[derive(Debug, Clone)]
pub struct RunCall {
    pub qualifier: String,
    pub event: RunEvent,
}

impl RunCall {
    pub fn index(&self) -> usize {
        self.event.index
    }

    pub fn code(&self) -> &str {
        &self.event.code
    }

    pub fn globals(&self) -> &Map<String, Value> {
        &self.event.globals
    }

    /// Decodes the inline input data.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Codec::decode_inline(&self.event.data)
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Run {
        result: Option<EncodedValue>,
        pretty: Option<String>,
    },
    Raw {
        payload: Value,
        function_error: Option<String>,
    },
    Transport(String),
}

/// What a scripted handler answers with.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    outcome: Outcome,
    logs: Vec<String>,
    delay: Option<Duration>,
}

impl ScriptedReply {
    fn from_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            logs: Vec::new(),
            delay: None,
        }
    }

    /// A successful RUN reply carrying `value` inline.
    pub fn value<T: Serialize>(value: T) -> Self {
        match Codec::encode_inline(&value) {
            Ok(encoded) => Self::from_outcome(Outcome::Run {
                result: Some(encoded),
                pretty: None,
            }),
            Err(err) => Self::transport_failure(format!("scripted value not encodable: {err}")),
        }
    }

    /// A successful RUN reply carrying an already encoded result.
    pub fn encoded(result: EncodedValue) -> Self {
        Self::from_outcome(Outcome::Run {
            result: Some(result),
            pretty: None,
        })
    }

    /// A RUN reply with only a human-readable rendering.
    pub fn pretty(rendering: impl Into<String>) -> Self {
        Self::from_outcome(Outcome::Run {
            result: None,
            pretty: Some(rendering.into()),
        })
    }

    /// An error envelope, as raised by user code.
    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_outcome(Outcome::Raw {
            payload: json!({
                "errorType": error_type.into(),
                "errorMessage": message.into(),
            }),
            function_error: Some("Unhandled".to_string()),
        })
    }

    /// An arbitrary JSON payload.
    pub fn raw(payload: Value) -> Self {
        Self::from_outcome(Outcome::Raw {
            payload,
            function_error: None,
        })
    }

    /// The call itself fails before reaching user code.
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::from_outcome(Outcome::Transport(message.into()))
    }

    /// Lines the user code printed.
    #[must_use]
    pub fn with_logs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.logs.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Delays the reply, to shuffle completion order.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
struct PublishedVersion {
    configuration: Option<FunctionConfiguration>,
    code: FunctionCode,
}

#[derive(Debug, Default)]
struct State {
    next_version: u64,
    configuration: Option<FunctionConfiguration>,
    configuration_history: Vec<FunctionConfiguration>,
    versions: BTreeMap<u64, PublishedVersion>,
    aliases: BTreeMap<String, String>,
    invocations: Vec<String>,
}

/// Scripted in-process backend function.
pub struct ScriptedInvoker {
    function_name: String,
    run_handler: Arc<RunHandler>,
    build_handler: Option<Arc<BuildHandler>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    function_exists: bool,
    fail_next_publish: AtomicBool,
    probes: AtomicUsize,
    publishes: AtomicUsize,
    builds: AtomicUsize,
    requests: AtomicUsize,
    state: Mutex<State>,
}

impl std::fmt::Debug for ScriptedInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedInvoker")
            .field("function_name", &self.function_name)
            .field("function_exists", &self.function_exists)
            .finish_non_exhaustive()
    }
}

impl ScriptedInvoker {
    /// Creates a backend whose RUN events are answered by `handler`.
    pub fn new<F>(function_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RunCall) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            function_name: function_name.into(),
            run_handler: Arc::new(handler),
            build_handler: None,
            blob_store: None,
            function_exists: true,
            fail_next_publish: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            state: Mutex::new(State {
                next_version: 1,
                ..State::default()
            }),
        }
    }

    /// Answers BUILD events with `handler` instead of succeeding.
    #[must_use]
    pub fn with_build_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BuildEvent) -> ScriptedReply + Send + Sync + 'static,
    {
        self.build_handler = Some(Arc::new(handler));
        self
    }

    /// Successful builds write a package into `store`, and publishing from a
    /// blob checks the object exists there.
    #[must_use]
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Makes the backend function itself missing.
    #[must_use]
    pub fn without_function(mut self) -> Self {
        self.function_exists = false;
        self
    }

    /// Makes the next `publish_version` call fail.
    pub fn fail_next_publish(&self) {
        self.fail_next_publish.store(true, Ordering::SeqCst);
    }

    /// Publishes a version and binds `alias` to it out of band, as if another
    /// session had deployed it.
    pub fn seed_alias(&self, alias: &str) {
        let mut state = self.state.lock();
        let version = state.next_version;
        state.next_version += 1;
        state.versions.insert(
            version,
            PublishedVersion {
                configuration: None,
                code: FunctionCode::Zip(Vec::new()),
            },
        );
        state.aliases.insert(alias.to_string(), version.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Qualifiers of every invocation, in call order.
    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().invocations.clone()
    }

    /// Every configuration applied to the baseline, in order.
    pub fn configuration_history(&self) -> Vec<FunctionConfiguration> {
        self.state.lock().configuration_history.clone()
    }

    /// Configuration captured when the version behind `alias` was published.
    pub fn alias_configuration(&self, alias: &str) -> Option<FunctionConfiguration> {
        let state = self.state.lock();
        let version: u64 = state.aliases.get(alias)?.parse().ok()?;
        state.versions.get(&version)?.configuration.clone()
    }

    /// Code the version behind `alias` was published from.
    pub fn alias_code(&self, alias: &str) -> Option<FunctionCode> {
        let state = self.state.lock();
        let version: u64 = state.aliases.get(alias)?.parse().ok()?;
        state.versions.get(&version).map(|v| v.code.clone())
    }

    fn ensure_function(&self) -> Result<(), InvokeError> {
        if self.function_exists {
            Ok(())
        } else {
            Err(InvokeError::NotFound {
                target: self.function_name.clone(),
            })
        }
    }

    fn qualifier_exists(&self, qualifier: &str) -> bool {
        if qualifier == BASELINE_VERSION {
            return true;
        }
        let state = self.state.lock();
        state.aliases.contains_key(qualifier)
            || qualifier
                .parse::<u64>()
                .is_ok_and(|v| state.versions.contains_key(&v))
    }

    fn not_found(&self, qualifier: &str) -> InvokeError {
        InvokeError::NotFound {
            target: format!("{}:{}", self.function_name, qualifier),
        }
    }

    fn reply_for(&self, qualifier: &str, event: Event) -> ScriptedReply {
        match event {
            Event::Run(event) => (self.run_handler)(&RunCall {
                qualifier: qualifier.to_string(),
                event,
            }),
            Event::Build(event) => {
                self.builds.fetch_add(1, Ordering::SeqCst);
                match &self.build_handler {
                    Some(handler) => handler(&event),
                    None => ScriptedReply::raw(json!({
                        "output": format!("installed {} requirements", event.requirements.len())
                    })),
                }
            }
        }
    }
}

/// Stand-in archive naming the requirements it was built from.
fn scripted_package(build: &BuildEvent) -> Vec<u8> {
    format!("PK scripted package: {}", build.requirements.join(" ")).into_bytes()
}

#[async_trait]
impl RemoteInvoker for ScriptedInvoker {
    fn function_name(&self) -> &str {
        &self.function_name
    }

    async fn probe(&self, qualifier: Option<&str>) -> Result<(), InvokeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.ensure_function()?;
        match qualifier {
            Some(q) if !self.qualifier_exists(q) => Err(self.not_found(q)),
            _ => Ok(()),
        }
    }

    async fn invoke(&self, qualifier: &str, payload: Vec<u8>) -> Result<InvokeOutput, InvokeError> {
        self.ensure_function()?;
        if !self.qualifier_exists(qualifier) {
            return Err(self.not_found(qualifier));
        }
        self.state.lock().invocations.push(qualifier.to_string());

        let event: Event = serde_json::from_slice(&payload).map_err(|e| InvokeError::Transport {
            message: "event payload is not a known event".to_string(),
            source: Some(Box::new(e)),
        })?;
        let build = match &event {
            Event::Build(build) => Some(build.clone()),
            Event::Run(_) => None,
        };

        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = format!("req-{request:06}");
        let reply = self.reply_for(qualifier, event);

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        let (payload, function_error) = match reply.outcome {
            Outcome::Transport(message) => return Err(InvokeError::transport(message)),
            Outcome::Run { result, pretty } => {
                let mut body = Map::new();
                body.insert(
                    "machine".to_string(),
                    json!(format!("{}/{}/{}", self.function_name, qualifier, request_id)),
                );
                if let Some(result) = result {
                    body.insert("result".to_string(), json!(result));
                }
                if let Some(pretty) = pretty {
                    body.insert("pretty".to_string(), json!(pretty));
                }
                (Value::Object(body), None)
            }
            Outcome::Raw {
                payload,
                function_error,
            } => (payload, function_error),
        };

        if let (Some(build), Some(store), None) = (&build, &self.blob_store, &function_error) {
            store
                .put(&build.blob_bucket, &build.blob_key, scripted_package(build))
                .await
                .map_err(|e| InvokeError::Transport {
                    message: "failed to upload built package".to_string(),
                    source: Some(Box::new(e)),
                })?;
        }

        let mut log_tail = format!("START RequestId: {request_id} Version: {qualifier}\n");
        for line in &reply.logs {
            log_tail.push_str(line);
            log_tail.push('\n');
        }
        log_tail.push_str(&format!("END RequestId: {request_id}\n"));
        log_tail.push_str(&format!(
            "REPORT RequestId: {request_id}\tDuration: 1.00 ms\n"
        ));

        let payload = serde_json::to_vec(&payload).map_err(|e| InvokeError::Transport {
            message: "failed to serialize scripted reply".to_string(),
            source: Some(Box::new(e)),
        })?;

        Ok(InvokeOutput {
            payload,
            log_tail: Some(log_tail),
            function_error,
        })
    }

    async fn update_configuration(
        &self,
        config: &FunctionConfiguration,
    ) -> Result<(), InvokeError> {
        self.ensure_function()?;
        let mut state = self.state.lock();
        state.configuration = Some(config.clone());
        state.configuration_history.push(config.clone());
        Ok(())
    }

    async fn publish_version(&self, code: FunctionCode) -> Result<String, InvokeError> {
        self.ensure_function()?;
        if self.fail_next_publish.swap(false, Ordering::SeqCst) {
            return Err(InvokeError::transport("scripted publish failure"));
        }
        if let (FunctionCode::Blob { bucket, key }, Some(store)) = (&code, &self.blob_store) {
            store.get(bucket, key).await.map_err(|e| InvokeError::Transport {
                message: format!("package {bucket}/{key} is not readable"),
                source: Some(Box::new(e)),
            })?;
        }

        self.publishes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let version = state.next_version;
        state.next_version += 1;
        let configuration = state.configuration.clone();
        state.versions.insert(
            version,
            PublishedVersion {
                configuration,
                code,
            },
        );
        Ok(version.to_string())
    }

    async fn get_alias(&self, name: &str) -> Result<Option<AliasInfo>, InvokeError> {
        self.ensure_function()?;
        Ok(self.state.lock().aliases.get(name).map(|version| AliasInfo {
            name: name.to_string(),
            version: version.clone(),
        }))
    }

    async fn put_alias(&self, name: &str, version: &str) -> Result<(), InvokeError> {
        self.ensure_function()?;
        let mut state = self.state.lock();
        let exists = version
            .parse::<u64>()
            .is_ok_and(|v| state.versions.contains_key(&v));
        if !exists {
            return Err(self.not_found(version));
        }
        state.aliases.insert(name.to_string(), version.to_string());
        Ok(())
    }

    async fn delete_alias(&self, name: &str) -> Result<(), InvokeError> {
        self.ensure_function()?;
        match self.state.lock().aliases.remove(name) {
            Some(_) => Ok(()),
            None => Err(self.not_found(name)),
        }
    }

    async fn delete_version(&self, version: &str) -> Result<(), InvokeError> {
        self.ensure_function()?;
        let removed = version
            .parse::<u64>()
            .ok()
            .and_then(|v| self.state.lock().versions.remove(&v));
        match removed {
            Some(_) => Ok(()),
            None => Err(self.not_found(version)),
        }
    }

    async fn list_aliases(&self) -> Result<Vec<AliasInfo>, InvokeError> {
        self.ensure_function()?;
        Ok(self
            .state
            .lock()
            .aliases
            .iter()
            .map(|(name, version)| AliasInfo {
                name: name.clone(),
                version: version.clone(),
            })
            .collect())
    }

    async fn list_versions(&self) -> Result<Vec<String>, InvokeError> {
        self.ensure_function()?;
        let state = self.state.lock();
        Ok(std::iter::once(BASELINE_VERSION.to_string())
            .chain(state.versions.keys().map(u64::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{parse_reply, Reply, RunReply};

    fn run_payload(index: usize, input: i64) -> Vec<u8> {
        serde_json::to_vec(&Event::Run(RunEvent {
            code: "INDEX + DATA".to_string(),
            index,
            data: Codec::encode_inline(&input).unwrap(),
            globals: Map::new(),
            blob_bucket: None,
        }))
        .unwrap()
    }

    fn adder() -> ScriptedInvoker {
        ScriptedInvoker::new("fn", |call| {
            let input: i64 = call.input().unwrap();
            ScriptedReply::value(input + call.index() as i64).with_logs(["computed"])
        })
    }

    #[tokio::test]
    async fn invoke_requires_existing_qualifier() {
        let invoker = adder();
        let err = invoker.invoke("missing", run_payload(0, 1)).await.unwrap_err();
        assert!(matches!(err, InvokeError::NotFound { .. }));
        invoker.invoke(BASELINE_VERSION, run_payload(0, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn run_reply_carries_result_and_logs() {
        let invoker = adder();
        let out = invoker.invoke(BASELINE_VERSION, run_payload(2, 40)).await.unwrap();
        let reply: Reply<RunReply> = parse_reply(&out.payload, None).unwrap();
        let Reply::Ok(reply) = reply else {
            panic!("expected ok reply");
        };
        let value: i64 = Codec::decode_inline(&reply.result.unwrap()).unwrap();
        assert_eq!(value, 42);
        let tail = out.log_tail.unwrap();
        assert!(tail.starts_with("START "));
        assert!(tail.contains("\ncomputed\n"));
    }

    #[tokio::test]
    async fn publish_and_alias_lifecycle() {
        let invoker = adder();
        let version = invoker
            .publish_version(FunctionCode::Zip(vec![1]))
            .await
            .unwrap();
        invoker.put_alias("a", &version).await.unwrap();
        assert_eq!(
            invoker.get_alias("a").await.unwrap(),
            Some(AliasInfo {
                name: "a".to_string(),
                version: version.clone()
            })
        );
        invoker.delete_alias("a").await.unwrap();
        invoker.delete_version(&version).await.unwrap();
        assert_eq!(invoker.list_versions().await.unwrap(), vec![BASELINE_VERSION]);
    }

    #[tokio::test]
    async fn missing_function_fails_every_call() {
        let invoker = adder().without_function();
        assert!(matches!(
            invoker.probe(None).await,
            Err(InvokeError::NotFound { .. })
        ));
        assert!(invoker.list_aliases().await.is_err());
    }

    #[tokio::test]
    async fn forced_publish_failure_is_one_shot() {
        let invoker = adder();
        invoker.fail_next_publish();
        assert!(invoker.publish_version(FunctionCode::Zip(vec![])).await.is_err());
        assert!(invoker.publish_version(FunctionCode::Zip(vec![])).await.is_ok());
        assert_eq!(invoker.publish_count(), 1);
    }
}
