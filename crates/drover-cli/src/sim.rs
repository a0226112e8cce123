//! In-memory fleet used by `drover run`.
//!
//! `SimController` implements the engine's stage-controller capability set
//! over a two-stage FSM (apply, then verify); `FleetSimulator` plays the
//! edge nodes, answering downstream commands with status reports on the
//! ingress channel. The engine itself only ever sees the trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use drover_core::controller::StageController;
use drover_core::fsm::{Action, Event, State};
use drover_core::message::{NodeCommand, NodeDescriptor, NodeTaskStatus, TaskMessage};

use crate::plan::TaskPlan;

/// Node state ending the apply stage.
const APPLIED: &str = "applied";
/// Task state while the verify stage runs.
const VERIFYING: &str = "verifying";

#[derive(Debug)]
struct SimNode {
    version: Option<String>,
    fail: bool,
}

#[derive(Debug)]
pub struct SimController {
    nodes: Vec<String>,
    fleet: HashMap<String, SimNode>,
    statuses: Mutex<HashMap<String, Vec<NodeTaskStatus>>>,
    task_states: Mutex<HashMap<String, State>>,
}

impl SimController {
    pub fn new(plan: &TaskPlan) -> Arc<Self> {
        Arc::new(Self {
            nodes: plan.nodes.iter().map(|node| node.name.clone()).collect(),
            fleet: plan
                .nodes
                .iter()
                .map(|node| {
                    (
                        node.name.clone(),
                        SimNode {
                            version: node.version.clone(),
                            fail: node.fail,
                        },
                    )
                })
                .collect(),
            statuses: Mutex::new(HashMap::new()),
            task_states: Mutex::new(HashMap::new()),
        })
    }

    pub fn task_state(&self, task_name: &str) -> State {
        self.task_states
            .lock()
            .expect("task states lock poisoned")
            .get(task_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_statuses(&self, task_name: &str) -> Vec<NodeTaskStatus> {
        self.statuses
            .lock()
            .expect("statuses lock poisoned")
            .get(task_name)
            .cloned()
            .unwrap_or_default()
    }

    fn should_fail(&self, node_name: &str) -> bool {
        self.fleet
            .get(node_name)
            .map(|node| node.fail)
            .unwrap_or(false)
    }
}

#[async_trait]
impl StageController for SimController {
    async fn get_node_status(&self, task_name: &str) -> Result<Vec<NodeTaskStatus>> {
        Ok(self.node_statuses(task_name))
    }

    async fn validate_nodes(&self, _task: &TaskMessage) -> Result<Vec<NodeDescriptor>> {
        Ok(self.nodes.iter().map(NodeDescriptor::new).collect())
    }

    async fn update_node_status(
        &self,
        task_name: &str,
        nodes: Vec<NodeTaskStatus>,
    ) -> Result<()> {
        self.statuses
            .lock()
            .expect("statuses lock poisoned")
            .insert(task_name.to_string(), nodes);
        Ok(())
    }

    async fn stage_completed(&self, task_name: &str, state: &State) -> bool {
        let phase = self.task_state(task_name);
        if phase.is_empty() {
            return state.as_str() == APPLIED || state.is_terminal();
        }
        state.is_terminal()
    }

    async fn report_node_status(
        &self,
        task_name: &str,
        node_name: &str,
        event: Event,
    ) -> Result<State> {
        let mut statuses = self.statuses.lock().expect("statuses lock poisoned");
        let nodes = statuses
            .get_mut(task_name)
            .ok_or_else(|| anyhow::anyhow!("unknown task {task_name}"))?;
        let node = nodes
            .iter_mut()
            .find(|node| node.node_name == node_name)
            .ok_or_else(|| anyhow::anyhow!("unknown node {node_name}"))?;

        let next = match event.action {
            Action::Failure => State::failure(),
            Action::Success if node.state.is_empty() => State::new(APPLIED),
            Action::Success => State::successful(),
        };
        node.state = next.clone();
        node.event = event.kind;
        node.action = Some(event.action);
        node.reason = event.error_msg.unwrap_or_default();
        node.touch();
        Ok(next)
    }

    async fn report_task_status(&self, task_name: &str, event: Event) -> Result<State> {
        let mut states = self.task_states.lock().expect("task states lock poisoned");
        let current = states.entry(task_name.to_string()).or_default();
        let next = if event.action == Action::Failure || event.error_msg.is_some() {
            State::failure()
        } else if current.is_empty() {
            State::new(VERIFYING)
        } else {
            State::successful()
        };
        debug!(task = task_name, from = %current, to = %next, "task stage transition");
        *current = next.clone();
        Ok(next)
    }

    async fn node_version(&self, node_name: &str) -> Result<String> {
        self.fleet
            .get(node_name)
            .and_then(|node| node.version.clone())
            .ok_or_else(|| anyhow::anyhow!("no version recorded for node {node_name}"))
    }
}

/// Plays the fleet: consumes downstream node commands and reports each
/// node's (simulated) outcome back through the ingress channel.
pub struct FleetSimulator {
    pub controller: Arc<SimController>,
    pub ingress: mpsc::Sender<TaskMessage>,
    pub task: TaskMessage,
    pub node_latency: Duration,
}

impl FleetSimulator {
    pub fn spawn(
        self,
        mut downstream: mpsc::Receiver<NodeCommand>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    command = downstream.recv() => {
                        let Some(command) = command else { return };
                        let Some(node_name) = node_of(&command) else {
                            warn!(resource = %command.router.resource, "command without a node name");
                            continue;
                        };
                        let controller = Arc::clone(&self.controller);
                        let ingress = self.ingress.clone();
                        let task = self.task.clone();
                        let latency = self.node_latency;
                        tokio::spawn(async move {
                            run_node_job(controller, ingress, task, node_name, latency).await;
                        });
                    }
                }
            }
        })
    }
}

async fn run_node_job(
    controller: Arc<SimController>,
    ingress: mpsc::Sender<TaskMessage>,
    task: TaskMessage,
    node_name: String,
    latency: Duration,
) {
    sleep(latency).await;

    let event = if controller.should_fail(&node_name) {
        Event::failure("simulate", format!("node {node_name} refused the rollout"))
    } else {
        Event::success("simulate")
    };
    let action = event.action;
    let reason = event.error_msg.clone().unwrap_or_default();

    let state = match controller
        .report_node_status(&task.name, &node_name, event)
        .await
    {
        Ok(state) => state,
        Err(err) => {
            warn!(node = %node_name, error = %err, "node report failed");
            return;
        }
    };

    let mut message = task;
    message.status = NodeTaskStatus {
        node_name,
        state,
        event: "simulate".to_string(),
        action: Some(action),
        reason,
        time: String::new(),
    };
    message.status.touch();
    if ingress.send(message).await.is_err() {
        debug!("ingress channel closed; dropping node report");
    }
}

fn node_of(command: &NodeCommand) -> Option<String> {
    command
        .router
        .resource
        .split('/')
        .nth(3)
        .map(str::to_string)
}
