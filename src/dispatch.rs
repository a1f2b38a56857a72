//! Bounded fan-out of one run across many remote workers.
//!
//! [`Dispatcher::run`] turns each input into a RUN event, submits the
//! events to the backend with at most `max_concurrency` calls in flight,
//! and collects one [`InvocationResult`] per input in input order. A
//! failing call only fills its own slot; siblings keep running.
//!
//! Remote log output is demultiplexed per call: platform lifecycle lines
//! (`START`, `END`, `REPORT`, `XRAY`) are dropped unless the run is
//! verbose, everything else is kept on the result and logged on the
//! `flock::remote` target.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::alias::{Alias, EnvironmentSpec};
use crate::codec::Codec;
use crate::error::{CodecError, SlotError};
use crate::events::{parse_reply, surface_log_lines, Event, Reply, RunEvent, RunReply};
use crate::guidance;
use crate::invoker::RemoteInvoker;

/// Default cap on in-flight invocations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;

/// Everything needed to run code against a deployed environment.
///
/// May be stored under a name and reused for later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub spec: EnvironmentSpec,
    pub alias: Alias,
    pub code: String,
    /// Local values shipped along with every call.
    #[serde(default)]
    pub globals: Map<String, Value>,
    #[serde(default)]
    pub verbose: bool,
}

/// One remote call of a fan-out.
#[derive(Debug, Clone)]
pub struct Task {
    pub alias: Alias,
    pub index: usize,
    pub payload: Vec<u8>,
    pub verbose: bool,
}

/// Outcome of the call for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    /// Position of the input this result belongs to.
    pub index: usize,
    /// Worker that ran the call, when it got that far.
    pub machine: Option<String>,
    /// Human-readable rendering sent by the worker, if any.
    pub rendering: Option<String>,
    pub outcome: Result<Value, SlotError>,
    /// Log lines surfaced for this call.
    pub logs: Vec<String>,
}

impl InvocationResult {
    pub(crate) fn failed(index: usize, error: SlotError) -> Self {
        Self {
            index,
            machine: None,
            rendering: None,
            outcome: Err(error),
            logs: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&SlotError> {
        self.outcome.as_ref().err()
    }

    /// Deserializes the decoded value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, SlotError> {
        let value = self.outcome.clone()?;
        serde_json::from_value(value).map_err(|e| SlotError::Decode(e.to_string()))
    }
}

/// Fans runs out over a [`RemoteInvoker`].
#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn RemoteInvoker>,
    codec: Codec,
    max_concurrency: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("function", &self.invoker.function_name())
            .field("codec", &self.codec)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn RemoteInvoker>, codec: Codec) -> Self {
        Self {
            invoker,
            codec,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Caps in-flight calls at `max` (at least one).
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Runs `config` once per input and returns results in input order.
    ///
    /// Never fails as a whole: every problem is reported in the slot of the
    /// input it belongs to.
    pub async fn run<T: Serialize>(
        &self,
        config: &RunConfig,
        inputs: &[T],
    ) -> Vec<InvocationResult> {
        let mut slots: Vec<Option<InvocationResult>> = (0..inputs.len()).map(|_| None).collect();
        let mut tasks = Vec::with_capacity(inputs.len());

        for (index, input) in inputs.iter().enumerate() {
            match self.build_task(config, index, input).await {
                Ok(task) => tasks.push(task),
                Err(err) => slots[index] = Some(InvocationResult::failed(index, err)),
            }
        }

        debug!(
            alias = %config.alias,
            calls = tasks.len(),
            max_concurrency = self.max_concurrency,
            "dispatching run"
        );

        if inputs.len() == 1 {
            if let Some(task) = tasks.pop() {
                let result = execute(self.invoker.as_ref(), &self.codec, task).await;
                slots[0] = Some(result);
            }
        } else {
            self.run_pool(tasks, &mut slots).await;
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    InvocationResult::failed(
                        index,
                        SlotError::Invoke("worker task aborted".to_string()),
                    )
                })
            })
            .collect()
    }

    async fn run_pool(&self, tasks: Vec<Task>, slots: &mut [Option<InvocationResult>]) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set = JoinSet::new();

        for task in tasks {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let index = task.index;
                    slots[index] = Some(InvocationResult::failed(
                        index,
                        SlotError::Invoke("dispatch pool closed".to_string()),
                    ));
                    continue;
                }
            };
            let invoker = Arc::clone(&self.invoker);
            let codec = self.codec.clone();
            set.spawn(async move {
                let result = execute(invoker.as_ref(), &codec, task).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    let index = result.index;
                    slots[index] = Some(result);
                }
                Err(err) => warn!(error = %err, "dispatch task did not complete"),
            }
        }
    }

    async fn build_task<T: Serialize>(
        &self,
        config: &RunConfig,
        index: usize,
        input: &T,
    ) -> Result<Task, SlotError> {
        let data = match self.codec.encode(input).await {
            Ok(data) => data,
            Err(CodecError::Overflow { size, limit }) => {
                warn!(index, size, limit, "input too large to send inline, replacing with null");
                Codec::encode_inline(&Value::Null).map_err(|e| SlotError::Encode(e.to_string()))?
            }
            Err(err) => return Err(SlotError::Encode(err.to_string())),
        };

        let event = Event::Run(RunEvent {
            code: config.code.clone(),
            index,
            data,
            globals: config.globals.clone(),
            blob_bucket: self.codec.blob_bucket().map(str::to_string),
        });
        let payload = serde_json::to_vec(&event).map_err(|e| SlotError::Encode(e.to_string()))?;

        Ok(Task {
            alias: config.alias.clone(),
            index,
            payload,
            verbose: config.verbose,
        })
    }
}

async fn execute(invoker: &dyn RemoteInvoker, codec: &Codec, task: Task) -> InvocationResult {
    let index = task.index;
    let output = match invoker.invoke(task.alias.as_str(), task.payload).await {
        Ok(output) => output,
        Err(err) => {
            warn!(index, alias = %task.alias, error = %err, "invocation failed");
            return InvocationResult::failed(index, SlotError::Invoke(err.to_string()));
        }
    };

    let logs = output
        .log_tail
        .as_deref()
        .map(|tail| surface_log_lines(tail, task.verbose))
        .unwrap_or_default();
    for line in &logs {
        info!(target: "flock::remote", index, "{line}");
    }

    let mut result = InvocationResult {
        index,
        machine: None,
        rendering: None,
        outcome: Ok(Value::Null),
        logs,
    };

    match parse_reply::<RunReply>(&output.payload, output.function_error.as_deref()) {
        Err(err) => result.outcome = Err(SlotError::Malformed(err.to_string())),
        Ok(Reply::Empty) => {}
        Ok(Reply::Error(err)) => {
            let hint = guidance::hint_for(&err.error_type, &err.message);
            if let Some(hint) = &hint {
                warn!(index, error_type = %err.error_type, "{hint}");
            }
            result.outcome = Err(SlotError::Remote {
                error_type: err.error_type,
                message: err.message,
                hint,
            });
        }
        Ok(Reply::Ok(reply)) => {
            result.machine = reply.machine;
            result.rendering = reply.pretty;
            if let Some(encoded) = reply.result {
                result.outcome = codec
                    .decode::<Value>(&encoded)
                    .await
                    .map_err(|e| SlotError::Decode(e.to_string()));
            }
        }
    }
    result
}
