// ABOUTME: Job tracker for long-running server methods
//
// A job method returns a numeric job id immediately. The tracker queries
// core.get_jobs for that id on a fixed interval until the job reaches a
// terminal state, reporting progress changes along the way.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::context::CallContext;
use super::error::{ClientError, ClientResult};
use super::Client;

/// Lifecycle state of a server job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    /// A state this client does not know; polling continues
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Whether the job has finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Progress reported by a running job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One job record as returned by `core.get_jobs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub method: String,
    pub state: JobState,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
}

impl Job {
    /// Name the job after `method` when the record leaves its method out.
    #[must_use]
    pub fn started_by(mut self, method: &str) -> Self {
        if self.method.is_empty() {
            self.method = method.to_string();
        }
        self
    }

    /// The job's result on success, or `JobFailed` for a failed or aborted job.
    pub fn into_result(self) -> ClientResult<Value> {
        match self.state {
            JobState::Success => Ok(self.result.unwrap_or(Value::Null)),
            state => {
                let message = self
                    .error
                    .filter(|e| !e.is_empty())
                    .or(self.exception.filter(|e| !e.is_empty()))
                    .unwrap_or_else(|| "no error detail reported".to_string());
                Err(ClientError::JobFailed {
                    id: self.id,
                    method: self.method,
                    state,
                    message,
                })
            }
        }
    }
}

impl Client {
    /// Fetch one job record.
    pub async fn get_job(&self, ctx: &CallContext, id: i64) -> ClientResult<Job> {
        let jobs: Vec<Job> = self
            .call(ctx, "core.get_jobs", vec![json!([["id", "=", id]])])
            .await?;
        jobs.into_iter().next().ok_or(ClientError::JobNotFound(id))
    }

    /// Start a job method and wait for it to finish, decoding its result.
    pub async fn call_job<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<T> {
        self.call_job_with_progress(ctx, method, params, |_| {}).await
    }

    /// Like [`call_job`](Self::call_job), calling `on_progress` whenever the
    /// job's reported progress changes.
    ///
    /// The context bounds the whole wait; each status query additionally
    /// gets the default call timeout when the context has no deadline.
    pub async fn call_job_with_progress<T, F>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
        mut on_progress: F,
    ) -> ClientResult<T>
    where
        T: DeserializeOwned,
        F: FnMut(&JobProgress),
    {
        let job_id: i64 = self.call(ctx, method, params).await?;
        let interval = self.inner.config.job_poll_interval;
        let started = Instant::now();
        info!(job_id, method, "Job started");

        let mut last_progress: Option<JobProgress> = None;
        loop {
            let job = self.get_job(ctx, job_id).await?;

            if job.progress.is_some() && job.progress != last_progress {
                if let Some(progress) = &job.progress {
                    on_progress(progress);
                }
                last_progress.clone_from(&job.progress);
            }

            if job.state.is_terminal() {
                debug!(job_id, method, state = %job.state, elapsed = ?started.elapsed(), "Job finished");
                let value = job.started_by(method).into_result().inspect_err(|e| {
                    warn!(job_id, method, error = %e, "Job did not succeed");
                })?;
                return Ok(serde_json::from_value(value)?);
            }

            tokio::select! {
                biased;
                err = ctx.done(started) => return Err(err),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}
