//! Workflow model: tasks, dependency edges, results, and the `$OUTPUT[...]`
//! reference grammar that threads outputs between tasks.

pub mod executor;
pub mod plan;

use crate::error::{PmlError, Result, WireError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A dependency-ordered list of tool calls.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Workflow {
    pub tasks: Vec<Task>,
}

/// One tool call inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Unique within the workflow.
    pub id: String,
    /// Tool id of the form `provider:name`.
    pub tool: String,
    /// Arbitrary JSON arguments; string leaves may be `$OUTPUT[...]`
    /// references into earlier tasks' outputs.
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// What dependents observe when this task fails: with `continue`, they
    /// run and see `null` for its output; with `abort` (default) they are
    /// skipped.
    #[serde(default)]
    pub on_error: ErrorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    #[default]
    Abort,
    Continue,
}

/// Exponential backoff, local to one task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Uniform noise factor in [0,1] applied as ±jitter·delay.
    #[serde(default)]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn skipped() -> Self {
        Self {
            status: TaskStatus::Skipped,
            output: Value::Null,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// The aggregate outcome of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResultBundle {
    /// Unique id of this execution, for correlation in logs.
    pub execution_id: String,
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<WireError>,
    pub parallelization_layers: usize,
    pub execution_time_ms: u64,
    /// Per-task results keyed by task id.
    pub results: BTreeMap<String, TaskResult>,
}

impl ResultBundle {
    pub fn from_results(
        results: BTreeMap<String, TaskResult>,
        parallelization_layers: usize,
        execution_time_ms: u64,
    ) -> Self {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();
        for result in results.values() {
            match result.status {
                TaskStatus::Success => succeeded += 1,
                TaskStatus::Error => {
                    failed += 1;
                    if let Some(error) = &result.error {
                        errors.push(error.clone());
                    }
                }
                TaskStatus::Skipped => skipped += 1,
            }
        }
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            total_tasks: results.len(),
            succeeded,
            failed,
            skipped,
            errors,
            parallelization_layers,
            execution_time_ms,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Canonical reference grammar: `$OUTPUT[<task-id>]` followed by any number
/// of `.field` or `[index]` steps.
static OUTPUT_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$OUTPUT\[([A-Za-z0-9_-]+)\]((?:\.[A-Za-z_$][\w$]*|\[\d+\])*)$")
        .expect("reference grammar is a valid regex")
});

static PATH_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.([A-Za-z_$][\w$]*)|\[(\d+)\]").expect("path grammar is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Parse a reference string into the referenced task id and path walk.
/// `None` when the string is not a reference at all.
pub fn parse_reference(raw: &str) -> Option<(String, Vec<PathSegment>)> {
    let captures = OUTPUT_REF.captures(raw)?;
    let task_id = captures.get(1)?.as_str().to_string();
    let path_raw = captures.get(2).map(|m| m.as_str()).unwrap_or("");
    let mut segments = Vec::new();
    for step in PATH_STEP.captures_iter(path_raw) {
        if let Some(field) = step.get(1) {
            segments.push(PathSegment::Field(field.as_str().to_string()));
        } else if let Some(index) = step.get(2) {
            let index = index.as_str().parse().ok()?;
            segments.push(PathSegment::Index(index));
        }
    }
    Some((task_id, segments))
}

fn walk_path<'a>(mut value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    for segment in segments {
        value = match segment {
            PathSegment::Field(field) => value.get(field)?,
            PathSegment::Index(index) => value.get(index)?,
        };
    }
    Some(value)
}

/// Replace every reference leaf in `arguments` with the resolved value from
/// `outputs`. Pure: resolved trees pass through unchanged, so applying it
/// twice yields the same value.
pub fn substitute_arguments(
    arguments: &Value,
    outputs: &BTreeMap<String, Value>,
) -> Result<Value> {
    match arguments {
        Value::String(raw) => match parse_reference(raw) {
            Some((task_id, segments)) => {
                let output = outputs.get(&task_id).ok_or_else(|| {
                    PmlError::invalid(format!(
                        "unresolved reference '{raw}': no output for task '{task_id}'"
                    ))
                })?;
                let resolved = walk_path(output, &segments).ok_or_else(|| {
                    PmlError::invalid(format!(
                        "unresolved reference '{raw}': path not present in output of '{task_id}'"
                    ))
                })?;
                Ok(resolved.clone())
            }
            None => Ok(arguments.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_arguments(item, outputs))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute_arguments(item, outputs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Task ids referenced anywhere inside an argument tree.
pub fn collect_references(arguments: &Value, into: &mut Vec<String>) {
    match arguments {
        Value::String(raw) => {
            if let Some((task_id, _)) = parse_reference(raw) {
                into.push(task_id);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, into);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, into);
            }
        }
        _ => {}
    }
}
