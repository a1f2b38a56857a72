//! AWS Lambda backend.
//!
//! [`LambdaInvoker`] implements [`RemoteInvoker`] on one Lambda function:
//! aliases and published versions of that function are the deployment
//! cache's storage. One SDK client is shared by every concurrent call.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_lambda::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{InvocationType, LastUpdateStatus, LogType, Runtime};
use aws_sdk_lambda::Client;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use tracing::{debug, trace};

use flock::error::InvokeError;
use flock::invoker::{AliasInfo, FunctionCode, FunctionConfiguration, InvokeOutput, RemoteInvoker};

/// Error code Lambda returns for a missing function, alias or version.
const NOT_FOUND_CODE: &str = "ResourceNotFoundException";

/// Polling cadence while a configuration or code update settles.
const UPDATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const UPDATE_POLL_ATTEMPTS: u32 = 120;

#[derive(Debug, Clone)]
pub struct LambdaInvoker {
    client: Client,
    function_name: String,
}

impl LambdaInvoker {
    /// Wraps a pre-built client.
    ///
    /// ```rust,no_run
    /// use flock_aws::lambda::LambdaInvoker;
    ///
    /// # async fn example() {
    /// let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    /// let invoker = LambdaInvoker::new(aws_sdk_lambda::Client::new(&config), "FlockLambda");
    /// # }
    /// ```
    pub fn new(client: Client, function_name: impl Into<String>) -> Self {
        Self {
            client,
            function_name: function_name.into(),
        }
    }

    /// Builds a client from the standard AWS config chain.
    pub async fn from_env(function_name: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), function_name)
    }

    fn target(&self, qualifier: &str) -> String {
        format!("{}:{}", self.function_name, qualifier)
    }

    /// Waits until the last configuration or code update has settled;
    /// Lambda rejects further updates while one is in progress.
    async fn wait_until_updated(&self) -> Result<(), InvokeError> {
        for attempt in 0..UPDATE_POLL_ATTEMPTS {
            let config = self
                .client
                .get_function_configuration()
                .function_name(&self.function_name)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &self.function_name))?;
            match config.last_update_status() {
                Some(LastUpdateStatus::InProgress) => {
                    trace!(attempt, "function update in progress");
                    tokio::time::sleep(UPDATE_POLL_INTERVAL).await;
                }
                Some(LastUpdateStatus::Failed) => {
                    return Err(InvokeError::transport(format!(
                        "update of {} failed: {}",
                        self.function_name,
                        config.last_update_status_reason().unwrap_or("no reason given")
                    )));
                }
                _ => return Ok(()),
            }
        }
        Err(InvokeError::transport(format!(
            "update of {} did not settle after {} attempts",
            self.function_name, UPDATE_POLL_ATTEMPTS
        )))
    }
}

fn map_sdk_error<E>(err: SdkError<E>, target: &str) -> InvokeError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if err.code() == Some(NOT_FOUND_CODE) {
        return InvokeError::NotFound {
            target: target.to_string(),
        };
    }
    InvokeError::Transport {
        message: format!("Lambda error for {target}: {}", DisplayErrorContext(&err)),
        source: Some(Box::new(err)),
    }
}

fn to_i32(field: &str, value: u32) -> Result<i32, InvokeError> {
    i32::try_from(value)
        .map_err(|_| InvokeError::transport(format!("{field} {value} is out of range")))
}

/// Decodes the base64 log tail Lambda returns with `LogType::Tail`.
pub fn decode_log_tail(encoded: &str) -> Option<String> {
    BASE64_STANDARD
        .decode(encoded)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl RemoteInvoker for LambdaInvoker {
    fn function_name(&self) -> &str {
        &self.function_name
    }

    async fn probe(&self, qualifier: Option<&str>) -> Result<(), InvokeError> {
        let target = self.target(qualifier.unwrap_or("function"));
        self.client
            .invoke()
            .function_name(&self.function_name)
            .set_qualifier(qualifier.map(str::to_string))
            .invocation_type(InvocationType::DryRun)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &target))?;
        debug!(target = %target, "probe hit");
        Ok(())
    }

    async fn invoke(&self, qualifier: &str, payload: Vec<u8>) -> Result<InvokeOutput, InvokeError> {
        let output = self
            .client
            .invoke()
            .function_name(&self.function_name)
            .qualifier(qualifier)
            .invocation_type(InvocationType::RequestResponse)
            .log_type(LogType::Tail)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.target(qualifier)))?;

        Ok(InvokeOutput {
            payload: output
                .payload()
                .map(|blob| blob.as_ref().to_vec())
                .unwrap_or_default(),
            log_tail: output.log_result().and_then(decode_log_tail),
            function_error: output.function_error().map(str::to_string),
        })
    }

    async fn update_configuration(
        &self,
        config: &FunctionConfiguration,
    ) -> Result<(), InvokeError> {
        self.wait_until_updated().await?;
        self.client
            .update_function_configuration()
            .function_name(&self.function_name)
            .runtime(Runtime::from(config.runtime.as_str()))
            .memory_size(to_i32("memory", config.memory_mb)?)
            .timeout(to_i32("timeout", config.timeout_secs)?)
            .handler(&config.handler)
            .set_layers(Some(config.layers.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.function_name))?;
        self.wait_until_updated().await
    }

    async fn publish_version(&self, code: FunctionCode) -> Result<String, InvokeError> {
        let request = self
            .client
            .update_function_code()
            .function_name(&self.function_name)
            .publish(true);
        let request = match code {
            FunctionCode::Zip(bytes) => request.zip_file(Blob::new(bytes)),
            FunctionCode::Blob { bucket, key } => request.s3_bucket(bucket).s3_key(key),
        };
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.function_name))?;
        let version = output
            .version()
            .map(str::to_string)
            .ok_or_else(|| InvokeError::transport("publish returned no version"))?;
        self.wait_until_updated().await?;
        Ok(version)
    }

    async fn get_alias(&self, name: &str) -> Result<Option<AliasInfo>, InvokeError> {
        let result = self
            .client
            .get_alias()
            .function_name(&self.function_name)
            .name(name)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.target(name)));
        match result {
            Ok(output) => Ok(Some(AliasInfo {
                name: output.name().unwrap_or(name).to_string(),
                version: output.function_version().unwrap_or_default().to_string(),
            })),
            Err(InvokeError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put_alias(&self, name: &str, version: &str) -> Result<(), InvokeError> {
        let updated = self
            .client
            .update_alias()
            .function_name(&self.function_name)
            .name(name)
            .function_version(version)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.target(name)));
        match updated {
            Ok(_) => Ok(()),
            Err(InvokeError::NotFound { .. }) => {
                self.client
                    .create_alias()
                    .function_name(&self.function_name)
                    .name(name)
                    .function_version(version)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, &self.target(name)))?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_alias(&self, name: &str) -> Result<(), InvokeError> {
        self.client
            .delete_alias()
            .function_name(&self.function_name)
            .name(name)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.target(name)))?;
        Ok(())
    }

    async fn delete_version(&self, version: &str) -> Result<(), InvokeError> {
        self.client
            .delete_function()
            .function_name(&self.function_name)
            .qualifier(version)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.target(version)))?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<AliasInfo>, InvokeError> {
        let mut aliases = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_aliases()
                .function_name(&self.function_name)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &self.function_name))?;
            aliases.extend(page.aliases().iter().filter_map(|alias| {
                Some(AliasInfo {
                    name: alias.name()?.to_string(),
                    version: alias.function_version()?.to_string(),
                })
            }));
            match page.next_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => return Ok(aliases),
            }
        }
    }

    async fn list_versions(&self) -> Result<Vec<String>, InvokeError> {
        let mut versions = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_versions_by_function()
                .function_name(&self.function_name)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &self.function_name))?;
            versions.extend(
                page.versions()
                    .iter()
                    .filter_map(|v| v.version().map(str::to_string)),
            );
            match page.next_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => return Ok(versions),
            }
        }
    }
}
