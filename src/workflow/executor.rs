//! Layered parallel execution of a validated workflow.
//!
//! Tasks in the same layer run concurrently (bounded by `max_parallelism`);
//! a layer completes before the next starts, which is what makes earlier-
//! layer output references safe. Failures stay local: dependents are skipped
//! (or observe `null` when the failed task declared `on_error: continue`)
//! and everything independent keeps running.

use super::plan::{self, ValidatedPlan};
use super::{
    substitute_arguments, ErrorMode, ResultBundle, RetryPolicy, Task, TaskResult, TaskStatus,
    Workflow,
};
use crate::config::DEFAULT_TASK_TIMEOUT_MS;
use crate::error::{PmlError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

/// The dispatch boundary. The gateway implements this against real
/// providers; tests plug in stubs.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn knows_tool(&self, tool_id: &str) -> bool;
    async fn call(&self, tool_id: &str, arguments: Value, timeout: Duration) -> Result<Value>;
}

/// Workflow-level execution options.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Whole-workflow deadline; 0 times out every task immediately.
    pub deadline_ms: Option<u64>,
    /// `Abort`: the first failure skips everything that has not started.
    /// `Continue` (default): independent branches keep running.
    pub on_error: ErrorMode,
    pub max_parallelism: Option<usize>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            deadline_ms: None,
            on_error: ErrorMode::Continue,
            max_parallelism: None,
        }
    }
}

pub struct WorkflowExecutor {
    invoker: Arc<dyn ToolInvoker>,
    default_parallelism: usize,
}

impl WorkflowExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>, default_parallelism: usize) -> Self {
        Self {
            invoker,
            default_parallelism: default_parallelism.max(1),
        }
    }

    /// Validate, layer, and run the workflow. Structural problems surface as
    /// an error before anything dispatches; per-task failures land in the
    /// bundle instead.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        options: &ExecuteOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<ResultBundle> {
        let invoker = Arc::clone(&self.invoker);
        let validated = plan::validate(workflow, |tool| invoker.knows_tool(tool))?;
        Ok(self.run(workflow, &validated, options, cancel).await)
    }

    async fn run(
        &self,
        workflow: &Workflow,
        validated: &ValidatedPlan,
        options: &ExecuteOptions,
        cancel: watch::Receiver<bool>,
    ) -> ResultBundle {
        let started = Instant::now();
        let deadline = options.deadline_ms.map(Duration::from_millis);
        let parallelism = options
            .max_parallelism
            .unwrap_or(self.default_parallelism)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));

        let mut results: BTreeMap<String, TaskResult> = BTreeMap::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        // Tasks whose failure skips dependents (on_error: abort, the default).
        let mut blocking_failures: HashSet<String> = HashSet::new();
        let mut abort_remaining = false;

        for layer in &validated.layers {
            let mut handles = Vec::with_capacity(layer.len());
            for &task_index in layer {
                let task = &workflow.tasks[task_index];

                // Deadline check comes first so a zero deadline times every
                // task out rather than skipping it.
                let remaining = deadline.map(|d| d.saturating_sub(started.elapsed()));
                if let Some(remaining) = remaining {
                    if remaining.is_zero() {
                        results.insert(
                            task.id.clone(),
                            error_result(
                                &task.id,
                                PmlError::Timeout {
                                    message: "workflow deadline expired".into(),
                                    timeout_ms: options.deadline_ms.unwrap_or(0),
                                },
                            ),
                        );
                        continue;
                    }
                }

                if abort_remaining {
                    results.insert(task.id.clone(), TaskResult::skipped());
                    continue;
                }
                if task
                    .depends_on
                    .iter()
                    .any(|dep| blocking_failures.contains(dep))
                {
                    results.insert(task.id.clone(), TaskResult::skipped());
                    continue;
                }

                let arguments = match substitute_arguments(&task.arguments, &outputs) {
                    Ok(arguments) => arguments,
                    Err(err) => {
                        results.insert(task.id.clone(), error_result(&task.id, err));
                        continue;
                    }
                };

                let timeout = task
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::from_millis(DEFAULT_TASK_TIMEOUT_MS));
                let timeout = match remaining {
                    Some(remaining) => timeout.min(remaining),
                    None => timeout,
                };

                let invoker = Arc::clone(&self.invoker);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                let task_id = task.id.clone();
                let tool = task.tool.clone();
                let retry = task.retry.clone().unwrap_or_default();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result =
                        run_task(invoker.as_ref(), &tool, arguments, timeout, &retry, cancel)
                            .await;
                    (task_id, result)
                }));
            }

            for outcome in join_all(handles).await {
                let (task_id, result) = match outcome {
                    Ok(done) => done,
                    Err(join_err) => {
                        warn!(error = %join_err, "task worker panicked");
                        continue;
                    }
                };
                let on_error_mode = workflow
                    .tasks
                    .iter()
                    .find(|t| t.id == task_id)
                    .map(|t| t.on_error)
                    .unwrap_or_default();
                match result {
                    Ok(task_result) => {
                        outputs.insert(task_id.clone(), task_result.output.clone());
                        results.insert(task_id, task_result);
                    }
                    Err(err) => {
                        debug!(task = %task_id, kind = err.kind(), "task failed");
                        match on_error_mode {
                            // Dependents observe null instead of being skipped.
                            ErrorMode::Continue => {
                                outputs.insert(task_id.clone(), Value::Null);
                            }
                            ErrorMode::Abort => {
                                blocking_failures.insert(task_id.clone());
                            }
                        }
                        if options.on_error == ErrorMode::Abort {
                            abort_remaining = true;
                        }
                        let wire = error_result(&task_id, err);
                        results.insert(task_id, wire);
                    }
                }
            }
        }

        ResultBundle::from_results(
            results,
            validated.layer_count(),
            started.elapsed().as_millis() as u64,
        )
    }
}

fn error_result(task_id: &str, err: PmlError) -> TaskResult {
    TaskResult {
        status: TaskStatus::Error,
        output: Value::Null,
        error: Some(err.to_wire(Some(task_id))),
        started_at: None,
        finished_at: None,
    }
}

/// One task: retry loop with exponential backoff, per-attempt timeout, and
/// cooperative cancellation at every suspension point.
async fn run_task(
    invoker: &dyn ToolInvoker,
    tool: &str,
    arguments: Value,
    timeout: Duration,
    retry: &RetryPolicy,
    mut cancel: watch::Receiver<bool>,
) -> Result<TaskResult> {
    let started_at = Utc::now();
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if *cancel.borrow() {
            return Err(cancelled());
        }
        let outcome = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel) => Err(cancelled()),
            outcome = tokio::time::timeout(timeout, invoker.call(tool, arguments.clone(), timeout)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(PmlError::Timeout {
                        message: format!("tool '{tool}' did not answer"),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };

        match outcome {
            Ok(output) => {
                return Ok(TaskResult {
                    status: TaskStatus::Success,
                    output,
                    error: None,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                });
            }
            Err(err @ PmlError::Cancelled { .. }) => return Err(err),
            Err(err) => {
                last_error = Some(err);
                if attempt + 1 < max_attempts {
                    let delay = backoff_delay(retry, attempt);
                    tokio::select! {
                        biased;
                        _ = wait_cancelled(&mut cancel) => return Err(cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| PmlError::internal("task finished without outcome")))
}

fn cancelled() -> PmlError {
    PmlError::Cancelled {
        message: "workflow cancelled".into(),
    }
}

/// Pends until the cancel flag flips to true. A dropped sender means the
/// workflow can never be cancelled, so that case pends forever too.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// `min(max_delay, base·2^attempt)` with ±jitter·delay uniform noise.
fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let base = retry.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = base.min(retry.max_delay_ms) as f64;
    let jitter = retry.jitter.clamp(0.0, 1.0);
    let delay = if jitter > 0.0 {
        let noise = rand::thread_rng().gen_range(-jitter..=jitter);
        (capped * (1.0 + noise)).max(0.0)
    } else {
        capped
    };
    Duration::from_millis(delay as u64)
}
