//! Per-task executor: drives every node of one task through the current
//! stage under a bounded worker pool, ingests status reports, enforces the
//! failure tolerance, and advances the task FSM at stage boundaries.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::controller::StageController;
use crate::error::EngineError;
use crate::fsm::{Action, Event, State};
use crate::message::{
    self, LEGACY_VERSION_CUTOFF, NodeCommand, NodeTaskStatus, NodeUpgradeJobRequest, TASK_UPGRADE,
    TaskMessage,
};
use crate::registry::ExecutorRegistry;
use crate::watcher::{self, TimeoutWatch};
use crate::worker::WorkerPool;

pub struct Executor {
    task: TaskMessage,
    controller: Arc<dyn StageController>,
    /// Written only by the scheduling loop; watchers hold read access.
    nodes: Arc<RwLock<Vec<NodeTaskStatus>>>,
    pool: WorkerPool,
    status_tx: mpsc::Sender<NodeTaskStatus>,
    downstream: mpsc::Sender<NodeCommand>,
    timeout: Duration,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Resolve the initial node slice and build the executor. When no status
    /// has been persisted yet, candidate nodes are enumerated and seeded
    /// with an empty state; an empty candidate set aborts creation.
    pub(crate) async fn init(
        task: TaskMessage,
        controller: Arc<dyn StageController>,
        downstream: mpsc::Sender<NodeCommand>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<NodeTaskStatus>)> {
        let mut nodes = controller.get_node_status(&task.name).await?;
        if nodes.is_empty() {
            let candidates = controller.validate_nodes(&task).await?;
            if candidates.is_empty() {
                return Err(EngineError::NoCandidateNodes {
                    task: task.name.clone(),
                }
                .into());
            }
            nodes = candidates
                .iter()
                .map(|node| NodeTaskStatus::seed(&node.name))
                .collect();
            controller
                .update_node_status(&task.name, nodes.clone())
                .await?;
        }

        let concurrency = config.concurrency_for(&task);
        let timeout = config.timeout_for(&task);
        let (status_tx, status_rx) =
            mpsc::channel(config.status_channel_capacity(concurrency));

        let executor = Arc::new(Self {
            task,
            controller,
            nodes: Arc::new(RwLock::new(nodes)),
            pool: WorkerPool::new(concurrency),
            status_tx,
            downstream,
            timeout,
            config,
            shutdown,
        });
        Ok((executor, status_rx))
    }

    pub fn task(&self) -> &TaskMessage {
        &self.task
    }

    /// Forward one status report into the scheduling loop. Back-pressures
    /// the caller while the loop is busy.
    pub async fn handle_message(&self, status: NodeTaskStatus) -> Result<()> {
        self.status_tx
            .send(status)
            .await
            .map_err(|_| anyhow!("executor {} is no longer accepting reports", self.task.key()))
    }

    /// Scheduling loop. Fills the pool for the current stage, then reacts to
    /// status reports until the task FSM turns terminal or the engine shuts
    /// down.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut status_rx: mpsc::Receiver<NodeTaskStatus>,
        registry: Arc<ExecutorRegistry>,
    ) {
        let total = self.node_count();
        let max_failed = total as f64 * self.task.failure_tolerate;
        let mut failed: HashSet<String> = HashSet::new();

        let mut cursor = match self.fill_stage(&mut failed, max_failed).await {
            Ok(cursor) => cursor,
            Err(err) => {
                error!(task = %self.task.key(), error = %err, "stage fill failed");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(task = %self.task.key(), "stop task executor");
                    return;
                }
                status = status_rx.recv() => {
                    let Some(status) = status else { return };
                    if status.is_empty() {
                        continue;
                    }
                    if !self
                        .controller
                        .stage_completed(&self.task.name, &status.state)
                        .await
                    {
                        continue;
                    }

                    let ended = match self.pool.end_job(&status.node_name) {
                        Ok(index) => index,
                        Err(err) => {
                            error!(task = %self.task.key(), error = %err, "ignoring completion");
                            continue;
                        }
                    };
                    self.store_status(ended, status.clone());

                    if let Err(err) = self.complete_node(&status, &mut failed, max_failed).await {
                        warn!(task = %self.task.key(), error = %err, "node completion aborted the task");
                        continue;
                    }

                    if cursor >= total {
                        if !self.pool.is_empty() {
                            continue;
                        }
                        let state = match self.report_stage_complete(&status).await {
                            Ok(state) => state,
                            Err(err) => {
                                error!(task = %self.task.key(), error = %err, "stage report failed");
                                continue;
                            }
                        };
                        if state.is_terminal() {
                            registry.remove(&self.task);
                            info!(task = %self.task.key(), state = %state, "task is finished");
                            return;
                        }
                        cursor = match self.fill_stage(&mut failed, max_failed).await {
                            Ok(cursor) => cursor,
                            Err(err) => {
                                error!(task = %self.task.key(), error = %err, "next stage fill failed");
                                0
                            }
                        };
                        continue;
                    }

                    let next = self.node_at(cursor);
                    match self.admit(next, cursor).await {
                        Ok(()) => cursor += 1,
                        Err(err) => {
                            error!(task = %self.task.key(), error = %err, "admission failed")
                        }
                    }
                }
            }
        }
    }

    /// Sweep the node slice from the front, routing already-completed nodes
    /// through the completion handler and admitting the rest until the pool
    /// is full. Returns the cursor: the first position not yet admitted, or
    /// the slice length after a full sweep.
    async fn fill_stage(&self, failed: &mut HashSet<String>, max_failed: f64) -> Result<usize> {
        let total = self.node_count();
        let mut cursor = 0;
        while cursor < total {
            let node = self.node_at(cursor);
            if self
                .controller
                .stage_completed(&self.task.name, &node.state)
                .await
            {
                self.complete_node(&node, failed, max_failed).await?;
                cursor += 1;
                continue;
            }
            match self.admit(node, cursor).await {
                Ok(()) => cursor += 1,
                Err(err) => {
                    info!(task = %self.task.key(), error = %err, "stage fill stopped");
                    break;
                }
            }
        }
        Ok(cursor)
    }

    /// Claim a pool slot for the node, then build its command, start its
    /// timeout watcher, and push the command downstream (the back-pressure
    /// point against the outbound transport).
    async fn admit(&self, node: NodeTaskStatus, index: usize) -> Result<()> {
        self.pool.add_job(&node.node_name, index)?;
        let command = self.build_command(&node).await;
        watcher::spawn(TimeoutWatch {
            task_name: self.task.name.clone(),
            nodes: Arc::clone(&self.nodes),
            index,
            controller: Arc::clone(&self.controller),
            timeout: self.timeout,
            poll_interval: self.config.watch_poll_interval(),
            shutdown: self.shutdown.clone(),
        });
        self.downstream
            .send(command)
            .await
            .map_err(|_| anyhow!("downstream channel closed"))?;
        Ok(())
    }

    /// Account for one node that finished its stage. Failed nodes count
    /// against the tolerance budget; breaching it shuts the pool down,
    /// waits for in-flight jobs to drain, then reports the abort.
    async fn complete_node(
        &self,
        node: &NodeTaskStatus,
        failed: &mut HashSet<String>,
        max_failed: f64,
    ) -> Result<()> {
        if node.state.is_failure() {
            failed.insert(node.node_name.clone());
        }
        if failed.is_empty() || (failed.len() as f64) < max_failed {
            return Ok(());
        }

        self.pool.begin_shutdown();
        let inflight = self.pool.len();
        if inflight > 0 {
            warn!(
                task = %self.task.key(),
                inflight,
                capacity = self.pool.capacity(),
                "waiting for in-flight workers to finish before aborting"
            );
            return Ok(());
        }

        let exceeded = EngineError::ToleranceExceeded {
            failed: failed.len(),
            total: self.node_count(),
        };
        let event = Event {
            kind: node.event.clone(),
            action: node.action.unwrap_or(Action::Failure),
            error_msg: Some(exceeded.to_string()),
        };
        self.controller
            .report_task_status(&self.task.name, event)
            .await
            .map_err(|err| anyhow!("{exceeded}, report status failed, {err}"))?;
        Err(exceeded.into())
    }

    async fn report_stage_complete(&self, node: &NodeTaskStatus) -> Result<State> {
        self.controller
            .report_task_status(&self.task.name, Event::success(node.event.clone()))
            .await
    }

    async fn build_command(&self, node: &NodeTaskStatus) -> NodeCommand {
        if self.task.task_type == TASK_UPGRADE {
            if let Some(command) = self.build_legacy_command(node).await {
                warn!(node = %node.node_name, "sending legacy upgrade command");
                return command;
            }
        }
        message::build_node_command(&self.task, node)
    }

    /// Compatibility route for upgrade tasks: nodes strictly below the
    /// version cutoff get the legacy command shape.
    async fn build_legacy_command(&self, node: &NodeTaskStatus) -> Option<NodeCommand> {
        let request: NodeUpgradeJobRequest =
            serde_json::from_value(self.task.payload.clone()).ok()?;
        let edge_version = match self.controller.node_version(&node.node_name).await {
            Ok(version) => version,
            Err(err) => {
                error!(node = %node.node_name, error = %err, "node version lookup failed");
                return None;
            }
        };
        match message::version_less(&edge_version, LEGACY_VERSION_CUTOFF) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!(node = %node.node_name, error = %err, "version comparison failed");
                return None;
            }
        }
        warn!(
            node = %node.node_name,
            version = %edge_version,
            cutoff = LEGACY_VERSION_CUTOFF,
            "edge version is below the legacy cutoff"
        );
        Some(message::build_legacy_upgrade_command(
            &self.task, &request, node,
        ))
    }

    fn store_status(&self, index: usize, status: NodeTaskStatus) {
        let mut nodes = self.nodes.write().expect("node slice lock poisoned");
        if index < nodes.len() {
            nodes[index] = status;
        }
    }

    fn node_count(&self) -> usize {
        self.nodes.read().expect("node slice lock poisoned").len()
    }

    fn node_at(&self, index: usize) -> NodeTaskStatus {
        self.nodes.read().expect("node slice lock poisoned")[index].clone()
    }
}
