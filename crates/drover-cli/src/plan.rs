//! Task plan files: the YAML input accepted by `drover validate` and
//! `drover run`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use drover_core::message::TaskMessage;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(PlanValidationError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanValidationError {
    #[error("plan name cannot be empty")]
    EmptyPlanName,
    #[error("plan must target at least one node")]
    NoNodes,
    #[error("node name cannot be empty")]
    EmptyNodeName,
    #[error("node {node} is listed more than once")]
    DuplicateNode { node: String },
    #[error("failure tolerance {value} is outside [0, 1]")]
    ToleranceOutOfRange { value: f64 },
}

/// One fleet task to drive: target nodes plus the per-task policy forwarded
/// to the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub concurrency: u32,
    #[serde(default)]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub failure_tolerate: f64,
    #[serde(default)]
    pub check_items: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanNode {
    pub name: String,
    /// Reported software version; feeds the upgrade compatibility route.
    #[serde(default)]
    pub version: Option<String>,
    /// Simulated outcome: the node reports a failure instead of succeeding.
    #[serde(default)]
    pub fail: bool,
}

fn default_task_type() -> String {
    "rollout".to_string()
}

impl TaskPlan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let data = std::fs::read_to_string(path).map_err(|source| PlanError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let plan: TaskPlan =
            serde_yaml::from_str(&data).map_err(|source| PlanError::YamlParse {
                path: path.to_path_buf(),
                source,
            })?;

        plan.validate().map_err(PlanError::InvalidPlan)?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.name.trim().is_empty() {
            return Err(PlanValidationError::EmptyPlanName);
        }
        if self.nodes.is_empty() {
            return Err(PlanValidationError::NoNodes);
        }
        if !(0.0..=1.0).contains(&self.failure_tolerate) {
            return Err(PlanValidationError::ToleranceOutOfRange {
                value: self.failure_tolerate,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(PlanValidationError::EmptyNodeName);
            }
            if !seen.insert(node.name.as_str()) {
                return Err(PlanValidationError::DuplicateNode {
                    node: node.name.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn to_task_message(&self) -> TaskMessage {
        TaskMessage {
            concurrency: self.concurrency,
            timeout_seconds: self.timeout_seconds,
            failure_tolerate: self.failure_tolerate,
            check_items: self.check_items.clone(),
            payload: self.payload.clone(),
            ..TaskMessage::new(&self.task_type, &self.name)
        }
    }
}
