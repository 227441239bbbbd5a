//! Task executor that delegates to an HTTP execution endpoint.
//!
//! The endpoint receives the task message as JSON and answers with
//! `{"status":"completed","output":..}`, `{"status":"suspended","bookmark":..}`
//! or `{"status":"failed","permanent":..,"message":..}`.
//! Server errors, throttling and transport failures are transient. Every other
//! non-success status and any unreadable answer is permanent.

use std::time::Duration;

use async_trait::async_trait;
use lodestar_application::TaskExecutor;
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{Bookmark, ExecutionFailure, ExecutionOutcome, TaskMessage};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// HTTP-based implementation of the execution capability.
#[derive(Clone)]
pub struct HttpTaskExecutor {
    http_client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTaskExecutor {
    /// Creates an executor posting to `endpoint`.
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(AppError::Validation(
                "executor endpoint must not be empty".to_owned(),
            ));
        }

        if timeout.is_zero() {
            return Err(AppError::Validation(
                "executor timeout must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            http_client,
            endpoint,
            timeout,
        })
    }

    async fn post(&self, task: &TaskMessage) -> Result<ExecutionOutcome, ExecutionFailure> {
        let response = self
            .http_client
            .post(self.endpoint.as_str())
            .timeout(self.timeout)
            .header("Idempotency-Key", task.id.to_string())
            .header("X-Lodestar-Group", task.group_key.as_str())
            .header("X-Lodestar-Attempt", task.attempt_count.to_string())
            .json(task)
            .send()
            .await
            .map_err(|error| {
                ExecutionFailure::transient(format!("execution transport error: {error}"))
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecutionFailure::transient(format!(
                "transient HTTP status {status} for task '{}'",
                task.id
            )));
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_owned());
            return Err(ExecutionFailure::permanent(format!(
                "execution failed with status {status}: {body}"
            )));
        }

        let answer = response.json::<ExecutionAnswer>().await.map_err(|error| {
            ExecutionFailure::permanent(format!("execution answer is unreadable: {error}"))
        })?;

        debug!(task_id = %task.id, status = %status, "execution endpoint answered");
        answer.into_outcome()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ExecutionAnswer {
    Completed {
        #[serde(default)]
        output: Value,
    },
    Suspended {
        bookmark: Bookmark,
    },
    Failed {
        #[serde(default)]
        permanent: bool,
        message: String,
    },
}

impl ExecutionAnswer {
    fn into_outcome(self) -> Result<ExecutionOutcome, ExecutionFailure> {
        match self {
            Self::Completed { output } => Ok(ExecutionOutcome::Completed { output }),
            Self::Suspended { bookmark } => Ok(ExecutionOutcome::Suspended { bookmark }),
            Self::Failed {
                permanent: true,
                message,
            } => Err(ExecutionFailure::permanent(message)),
            Self::Failed { message, .. } => Err(ExecutionFailure::transient(message)),
        }
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute(
        &self,
        task: &TaskMessage,
        cancellation: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        tokio::select! {
            outcome = self.post(task) => outcome,
            () = cancellation.cancelled() => Err(ExecutionFailure::transient(format!(
                "execution of task '{}' cancelled by shutdown",
                task.id
            ))),
        }
    }
}
