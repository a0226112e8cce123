use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

use drover_core::config::EngineConfig;
use drover_core::controller::{ControllerRegistry, StageController};
use drover_core::fsm::{Event, State};
use drover_core::message::{
    LEGACY_UPGRADE_MODULE, NodeCommand, NodeDescriptor, NodeTaskStatus, TASK_MANAGER_MODULE,
    TASK_UPGRADE, TaskMessage,
};
use drover_core::registry::ExecutorRegistry;

/// Upgrade controller double reporting a fixed software version per node.
#[derive(Debug)]
struct VersionedController {
    versions: HashMap<String, String>,
    statuses: Mutex<HashMap<String, Vec<NodeTaskStatus>>>,
}

impl VersionedController {
    fn new(versions: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            versions: versions
                .iter()
                .map(|(node, version)| (node.to_string(), version.to_string()))
                .collect(),
            statuses: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl StageController for VersionedController {
    async fn get_node_status(&self, task_name: &str) -> Result<Vec<NodeTaskStatus>> {
        Ok(self
            .statuses
            .lock()
            .expect("statuses lock")
            .get(task_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn validate_nodes(&self, _task: &TaskMessage) -> Result<Vec<NodeDescriptor>> {
        let mut names: Vec<&String> = self.versions.keys().collect();
        names.sort();
        Ok(names.into_iter().map(NodeDescriptor::new).collect())
    }

    async fn update_node_status(
        &self,
        task_name: &str,
        nodes: Vec<NodeTaskStatus>,
    ) -> Result<()> {
        self.statuses
            .lock()
            .expect("statuses lock")
            .insert(task_name.to_string(), nodes);
        Ok(())
    }

    async fn stage_completed(&self, _task_name: &str, state: &State) -> bool {
        state.is_terminal()
    }

    async fn report_node_status(
        &self,
        _task_name: &str,
        _node_name: &str,
        _event: Event,
    ) -> Result<State> {
        Ok(State::failure())
    }

    async fn report_task_status(&self, _task_name: &str, _event: Event) -> Result<State> {
        Ok(State::successful())
    }

    async fn node_version(&self, node_name: &str) -> Result<String> {
        self.versions
            .get(node_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown node {node_name}"))
    }
}

fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

async fn recv_command(downstream: &mut mpsc::Receiver<NodeCommand>) -> NodeCommand {
    timeout(Duration::from_secs(2), downstream.recv())
        .await
        .expect("timed out waiting for a node command")
        .expect("downstream channel closed")
}

fn upgrade_task() -> TaskMessage {
    TaskMessage {
        concurrency: 2,
        payload: serde_json::json!({"version": "v1.17.0", "image": "registry/pkg"}),
        ..TaskMessage::new(TASK_UPGRADE, "job-a")
    }
}

#[tokio::test]
async fn test_nodes_below_cutoff_get_the_legacy_command() {
    let _trace = init_tracing();
    let controller =
        VersionedController::new(&[("edge-new", "v1.16.0"), ("edge-old", "v1.15.0")]);
    let controllers = ControllerRegistry::new();
    controllers.register(TASK_UPGRADE, controller);

    let (downstream_tx, mut downstream_rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let registry = ExecutorRegistry::new(
        controllers,
        downstream_tx,
        EngineConfig {
            default_concurrency: 1,
            default_timeout_seconds: 300,
            status_channel_slack: 10,
            watch_poll_interval_secs: 0.05,
        },
        shutdown.clone(),
    );

    registry
        .get_or_create(&upgrade_task())
        .await
        .expect("create executor");

    let first = recv_command(&mut downstream_rx).await;
    let second = recv_command(&mut downstream_rx).await;

    // Sorted enumeration: edge-new first, edge-old second.
    assert_eq!(first.router.module, TASK_MANAGER_MODULE);
    assert_eq!(first.router.resource, "upgrade/job-a/node/edge-new");
    assert_eq!(first.body["taskID"], "job-a");
    assert_eq!(first.body["item"]["version"], "v1.17.0");

    assert_eq!(second.router.module, LEGACY_UPGRADE_MODULE);
    assert_eq!(second.router.resource, "upgrade/job-a/node/edge-old");
    assert_eq!(second.body["upgradeID"], "job-a");
    assert_eq!(second.body["upgradeTool"], "keadm");
    assert_eq!(second.body["version"], "v1.17.0");
    assert_eq!(second.body["image"], "registry/pkg");
    let history_id = second.body["historyID"].as_str().expect("history id");
    assert!(!history_id.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn test_non_upgrade_payload_falls_back_to_current_format() {
    let _trace = init_tracing();
    let controller = VersionedController::new(&[("edge-old", "v1.15.0")]);
    let controllers = ControllerRegistry::new();
    controllers.register(TASK_UPGRADE, controller);

    let (downstream_tx, mut downstream_rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let registry = ExecutorRegistry::new(
        controllers,
        downstream_tx,
        EngineConfig {
            default_concurrency: 1,
            default_timeout_seconds: 300,
            status_channel_slack: 10,
            watch_poll_interval_secs: 0.05,
        },
        shutdown.clone(),
    );

    // A payload without a version cannot be a legacy upgrade request.
    let task = TaskMessage {
        payload: serde_json::json!({"archive": "bundle.tar"}),
        ..TaskMessage::new(TASK_UPGRADE, "job-b")
    };
    registry.get_or_create(&task).await.expect("create executor");

    let command = recv_command(&mut downstream_rx).await;
    assert_eq!(command.router.module, TASK_MANAGER_MODULE);
    assert_eq!(command.body["item"]["archive"], "bundle.tar");

    shutdown.cancel();
}
