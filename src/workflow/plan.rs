//! Workflow validation and layering, plus the planner seam that turns an
//! intent into a workflow when the caller does not supply one.

use super::{collect_references, Task, Workflow};
use crate::error::{PmlError, Result};
use crate::graph::Capability;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};

/// A validated workflow: Kahn layering plus the layer index of every task.
/// Tasks in layer L all complete before layer L+1 starts.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    /// Task indices grouped by layer, each layer sorted by task id.
    pub layers: Vec<Vec<usize>>,
    pub layer_of: HashMap<String, usize>,
}

impl ValidatedPlan {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

/// Validate structure, detect cycles (Kahn), compute layers, and check that
/// every `$OUTPUT` reference points strictly earlier in topological order.
pub fn validate(workflow: &Workflow, knows_tool: impl Fn(&str) -> bool) -> Result<ValidatedPlan> {
    let tasks = &workflow.tasks;
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if task.id.is_empty() {
            return Err(PmlError::invalid("task id must not be empty"));
        }
        if index_of.insert(task.id.as_str(), i).is_some() {
            return Err(PmlError::invalid(format!("duplicate task id '{}'", task.id)));
        }
    }

    for task in tasks {
        if !knows_tool(&task.tool) {
            return Err(PmlError::not_found("tool", task.tool.clone()));
        }
        for dep in &task.depends_on {
            if !index_of.contains_key(dep.as_str()) {
                return Err(PmlError::invalid(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
            if dep == &task.id {
                return Err(PmlError::invalid(format!(
                    "task '{}' depends on itself",
                    task.id
                )));
            }
        }
    }

    // Kahn's algorithm over depends_on edges, layer by layer.
    let mut in_degree: Vec<usize> = tasks.iter().map(|t| t.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            dependents[index_of[dep.as_str()]].push(i);
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut layer_of: HashMap<String, usize> = HashMap::with_capacity(tasks.len());
    let mut frontier: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut seen = frontier.len();

    while !frontier.is_empty() {
        let mut layer: Vec<usize> = frontier.drain(..).collect();
        layer.sort_by(|&a, &b| tasks[a].id.cmp(&tasks[b].id));
        for &i in &layer {
            layer_of.insert(tasks[i].id.clone(), layers.len());
        }
        let mut next = VecDeque::new();
        for &i in &layer {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push_back(dependent);
                    seen += 1;
                }
            }
        }
        layers.push(layer);
        frontier = next;
    }

    if seen != tasks.len() {
        let mut cycle_members: Vec<&str> = tasks
            .iter()
            .filter(|t| !layer_of.contains_key(&t.id))
            .map(|t| t.id.as_str())
            .collect();
        cycle_members.sort_unstable();
        return Err(PmlError::invalid(format!(
            "workflow contains a dependency cycle through tasks: {}",
            cycle_members.join(", ")
        )));
    }

    // References may only point at tasks in strictly earlier layers; the
    // layer barrier is what guarantees the output exists at dispatch time.
    for task in tasks {
        let mut references = Vec::new();
        collect_references(&task.arguments, &mut references);
        for reference in references {
            let Some(&ref_layer) = layer_of.get(&reference) else {
                return Err(PmlError::invalid(format!(
                    "task '{}' references unknown task '{reference}'",
                    task.id
                )));
            };
            if ref_layer >= layer_of[&task.id] {
                return Err(PmlError::invalid(format!(
                    "task '{}' references '{reference}', which does not complete before it",
                    task.id
                )));
            }
        }
    }

    Ok(ValidatedPlan { layers, layer_of })
}

/// Planner seam: expands a natural-language intent into a workflow. An
/// LLM-backed planner lives outside the core; the shipped implementation is
/// the capability-template expansion below.
#[async_trait]
pub trait WorkflowPlanner: Send + Sync {
    async fn plan(&self, intent: &str) -> Result<Workflow>;
}

/// Expand a leaf capability into a sequential template: each member tool
/// becomes one task, threaded through the conventional `input` argument.
pub fn expand_capability(capability: &Capability, intent: &str) -> Result<Workflow> {
    if capability.members.is_empty() {
        return Err(PmlError::invalid(format!(
            "capability '{}' has no member tools to expand",
            capability.id
        )));
    }
    let mut tasks = Vec::with_capacity(capability.members.len());
    for (i, tool) in capability.members.iter().enumerate() {
        let id = format!("step{}", i + 1);
        let arguments = if i == 0 {
            json!({ "input": intent })
        } else {
            json!({ "input": format!("$OUTPUT[step{i}]") })
        };
        tasks.push(Task {
            id,
            tool: tool.clone(),
            arguments,
            depends_on: if i == 0 {
                Vec::new()
            } else {
                vec![format!("step{i}")]
            },
            timeout_ms: None,
            retry: None,
            on_error: Default::default(),
        });
    }
    Ok(Workflow { tasks })
}
