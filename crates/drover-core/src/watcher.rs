//! Per-job timeout watcher.
//!
//! Each admitted node job gets a watcher polling the shared node slice. The
//! watcher's decision is advisory: it only submits a failure event through
//! the controller; the authoritative completion is the next status report
//! processed by the scheduling loop.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::StageController;
use crate::fsm::{Event, State};
use crate::message::NodeTaskStatus;

pub(crate) struct TimeoutWatch {
    pub task_name: String,
    pub nodes: Arc<RwLock<Vec<NodeTaskStatus>>>,
    pub index: usize,
    pub controller: Arc<dyn StageController>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown: CancellationToken,
}

pub(crate) fn spawn(watch: TimeoutWatch) -> JoinHandle<()> {
    tokio::spawn(watch.run())
}

impl TimeoutWatch {
    async fn run(self) {
        let (node_name, initial) = self.observe();
        let deadline = Instant::now() + self.timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let (_, state) = self.observe();
                    if state != initial || state.is_terminal() {
                        return;
                    }
                    if Instant::now() >= deadline {
                        break;
                    }
                    debug!(node = %node_name, "node stage is not completed");
                }
            }
        }

        let event = Event::failure(
            "TimeOut",
            format!(
                "node task execution timed out after {}s",
                self.timeout.as_secs()
            ),
        );
        if let Err(err) = self
            .controller
            .report_node_status(&self.task_name, &node_name, event)
            .await
        {
            warn!(node = %node_name, error = %err, "failed to report node timeout");
        }
    }

    fn observe(&self) -> (String, State) {
        let nodes = self.nodes.read().expect("node slice lock poisoned");
        match nodes.get(self.index) {
            Some(node) => (node.node_name.clone(), node.state.clone()),
            None => (String::new(), State::default()),
        }
    }
}
