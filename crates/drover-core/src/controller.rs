//! Stage-controller capability set and the per-task-type registry.
//!
//! A controller supplies everything domain-specific the engine needs:
//! candidate-node enumeration, persisted per-node status, stage-completion
//! predicates, and FSM reporting. The engine only ever talks to this trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::fsm::{Event, State};
use crate::message::{NodeDescriptor, NodeTaskStatus, TaskMessage};

#[async_trait]
pub trait StageController: Send + Sync + std::fmt::Debug {
    /// Currently persisted per-node status for a task; empty on first run.
    async fn get_node_status(&self, task_name: &str) -> anyhow::Result<Vec<NodeTaskStatus>>;

    /// Enumerate candidate nodes matching the task's selector. Only
    /// consulted when no status has been persisted yet.
    async fn validate_nodes(&self, task: &TaskMessage) -> anyhow::Result<Vec<NodeDescriptor>>;

    /// Persist the initial per-node status records.
    async fn update_node_status(
        &self,
        task_name: &str,
        nodes: Vec<NodeTaskStatus>,
    ) -> anyhow::Result<()>;

    /// Does this state terminate the task's current stage for a node?
    async fn stage_completed(&self, task_name: &str, state: &State) -> bool;

    /// Record a per-node event and drive that node's FSM.
    async fn report_node_status(
        &self,
        task_name: &str,
        node_name: &str,
        event: Event,
    ) -> anyhow::Result<State>;

    /// Drive the task-level FSM.
    async fn report_task_status(&self, task_name: &str, event: Event) -> anyhow::Result<State>;

    /// Observed software version of a node. Only the upgrade compatibility
    /// path consults this; controllers without the notion may keep the
    /// default.
    async fn node_version(&self, node_name: &str) -> anyhow::Result<String> {
        anyhow::bail!("node version lookup is not supported for node {node_name}")
    }
}

/// Controllers registered by task-type tag.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: RwLock<HashMap<String, Arc<dyn StageController>>>,
}

impl ControllerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, task_type: impl Into<String>, controller: Arc<dyn StageController>) {
        let task_type = task_type.into();
        self.controllers
            .write()
            .expect("controller registry lock poisoned")
            .insert(task_type.clone(), controller);
        tracing::info!(task_type, "registered stage controller");
    }

    pub fn resolve(&self, task_type: &str) -> EngineResult<Arc<dyn StageController>> {
        self.controllers
            .read()
            .expect("controller registry lock poisoned")
            .get(task_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTaskType {
                task_type: task_type.to_string(),
            })
    }
}
