//! Task ingress messages, per-node status records, and the downstream
//! node-command envelope.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fsm::{Action, State};

/// Task tag carried by upgrade jobs; also the literal tag used by the
/// legacy command route.
pub const TASK_UPGRADE: &str = "upgrade";

/// Nodes strictly below this version get the legacy command format.
pub const LEGACY_VERSION_CUTOFF: &str = "v1.16.0";

/// Separator joining the elements of a resource key.
pub const RESOURCE_SEP: char = '/';

pub const TASK_MANAGER_MODULE: &str = "taskmanager";
pub const TASK_MANAGER_GROUP: &str = "taskmanager";
pub const LEGACY_UPGRADE_MODULE: &str = "nodeupgradejobcontroller";
pub const LEGACY_UPGRADE_GROUP: &str = "nodeupgradejobcontroller";

/// Immutable description of one task instance, as received on the ingress
/// channel. Later messages for the same `(type, name)` key carry per-node
/// status reports in `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    /// In-flight cap; zero means "engine default".
    #[serde(default)]
    pub concurrency: u32,
    /// Per-node timeout; zero means "engine default".
    #[serde(default)]
    pub timeout_seconds: u32,
    /// Fraction of nodes allowed to fail before the task aborts.
    #[serde(default)]
    pub failure_tolerate: f64,
    #[serde(default, rename = "checkItem")]
    pub check_items: Vec<String>,
    /// Opaque domain payload forwarded to nodes.
    #[serde(default, rename = "msg")]
    pub payload: serde_json::Value,
    /// When set, remove any executor registered under this key.
    #[serde(default)]
    pub shutdown: bool,
    #[serde(default)]
    pub status: NodeTaskStatus,
}

impl TaskMessage {
    pub fn new(task_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            name: name.into(),
            concurrency: 0,
            timeout_seconds: 0,
            failure_tolerate: 0.0,
            check_items: Vec::new(),
            payload: serde_json::Value::Null,
            shutdown: false,
            status: NodeTaskStatus::default(),
        }
    }

    /// Composite registry key for this task.
    pub fn key(&self) -> String {
        format!("{}::{}", self.task_type, self.name)
    }
}

/// One node's progress through the current task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTaskStatus {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub time: String,
}

impl NodeTaskStatus {
    /// Initial record for a freshly enumerated node; empty state means the
    /// node has not started the current stage.
    pub fn seed(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Structurally empty reports are dropped by the scheduling loop.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Stamp the record with the current wall-clock time.
    pub fn touch(&mut self) {
        self.time = Utc::now().to_rfc3339();
    }
}

/// Candidate node returned by a controller's selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Routing tuple carried by every downstream node command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub module: String,
    pub group: String,
    pub resource: String,
    pub operation: String,
}

/// Envelope pushed onto the shared downstream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub router: Router,
    pub body: serde_json::Value,
}

/// Current-format command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTaskRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub state: String,
    pub item: serde_json::Value,
}

/// Pre-check payload substituted for the task payload in the checking state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePreCheckRequest {
    #[serde(rename = "checkItem")]
    pub check_items: Vec<String>,
}

/// Legacy-format command body, only emitted for upgrade tasks targeting
/// nodes below the version cutoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpgradeJobRequest {
    #[serde(default, rename = "upgradeID")]
    pub upgrade_id: String,
    #[serde(default, rename = "historyID")]
    pub history_id: String,
    #[serde(default, rename = "upgradeTool")]
    pub upgrade_tool: String,
    pub version: String,
    #[serde(default)]
    pub image: String,
}

pub fn task_resource(task_type: &str, task_name: &str, node_name: &str) -> String {
    [task_type, task_name, "node", node_name].join(&RESOURCE_SEP.to_string())
}

pub fn legacy_upgrade_resource(task_name: &str, node_name: &str) -> String {
    task_resource(TASK_UPGRADE, task_name, node_name)
}

/// Build the current-format command for one node. In the checking state the
/// item carries the configured check list instead of the task payload.
pub fn build_node_command(task: &TaskMessage, node: &NodeTaskStatus) -> NodeCommand {
    let item = if node.state.is_checking() {
        serde_json::to_value(NodePreCheckRequest {
            check_items: task.check_items.clone(),
        })
        .unwrap_or(serde_json::Value::Null)
    } else {
        task.payload.clone()
    };

    let request = NodeTaskRequest {
        task_id: task.name.clone(),
        task_type: task.task_type.clone(),
        state: node.state.as_str().to_string(),
        item,
    };

    NodeCommand {
        router: Router {
            module: TASK_MANAGER_MODULE.to_string(),
            group: TASK_MANAGER_GROUP.to_string(),
            resource: task_resource(&task.task_type, &task.name, &node.node_name),
            operation: TASK_UPGRADE.to_string(),
        },
        body: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
    }
}

/// Build the legacy-format command for one node, with a freshly generated
/// history id.
pub fn build_legacy_upgrade_command(
    task: &TaskMessage,
    request: &NodeUpgradeJobRequest,
    node: &NodeTaskStatus,
) -> NodeCommand {
    let body = NodeUpgradeJobRequest {
        upgrade_id: task.name.clone(),
        history_id: Uuid::new_v4().to_string(),
        upgrade_tool: "keadm".to_string(),
        version: request.version.clone(),
        image: request.image.clone(),
    };

    NodeCommand {
        router: Router {
            module: LEGACY_UPGRADE_MODULE.to_string(),
            group: LEGACY_UPGRADE_GROUP.to_string(),
            resource: legacy_upgrade_resource(&task.name, &node.node_name),
            operation: TASK_UPGRADE.to_string(),
        },
        body: serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
    }
}

/// Compare two `vMAJOR.MINOR.PATCH` strings; true when `left` sorts strictly
/// before `right`.
pub fn version_less(left: &str, right: &str) -> Result<bool> {
    Ok(parse_version(left)? < parse_version(right)?)
}

fn parse_version(version: &str) -> Result<(u64, u64, u64)> {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let mut next = |label: &str| -> Result<u64> {
        parts
            .next()
            .with_context(|| format!("version '{version}' is missing its {label} component"))?
            .parse()
            .with_context(|| format!("version '{version}' has a non-numeric {label} component"))
    };
    let parsed = (next("major")?, next("minor")?, next("patch")?);
    if parts.next().is_some() {
        bail!("version '{version}' has trailing components");
    }
    Ok(parsed)
}
