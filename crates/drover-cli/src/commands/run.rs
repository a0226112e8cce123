use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_core::config::EngineConfig;
use drover_core::controller::ControllerRegistry;
use drover_core::registry::ExecutorRegistry;

use crate::plan::TaskPlan;
use crate::sim::{FleetSimulator, SimController};

#[derive(Args)]
pub struct Run {
    /// Task plan YAML file
    #[arg(value_name = "PLAN_FILE")]
    pub plan: PathBuf,

    /// Simulated per-node latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub node_latency_ms: u64,

    /// Maximum time to wait for the task to finish, in seconds
    #[arg(short, long, default_value_t = 300)]
    pub timeout: u64,
}

impl Run {
    pub async fn execute(self) -> Result<()> {
        let plan = TaskPlan::load(&self.plan)?;
        let task = plan.to_task_message();
        info!(task = %task.key(), nodes = plan.nodes.len(), "starting fleet task");

        let controller = SimController::new(&plan);
        let controllers = ControllerRegistry::new();
        controllers.register(&plan.task_type, Arc::clone(&controller) as Arc<dyn drover_core::controller::StageController>);

        let (downstream_tx, downstream_rx) = mpsc::channel(64);
        let (ingress_tx, ingress_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let registry = ExecutorRegistry::new(
            controllers,
            downstream_tx,
            EngineConfig::default(),
            shutdown.clone(),
        );
        registry.start(ingress_rx);

        FleetSimulator {
            controller: Arc::clone(&controller),
            ingress: ingress_tx.clone(),
            task: task.clone(),
            node_latency: Duration::from_millis(self.node_latency_ms),
        }
        .spawn(downstream_rx, shutdown.clone());

        ingress_tx.send(task.clone()).await?;

        let watched = Arc::clone(&controller);
        let task_name = plan.name.clone();
        let wait = timeout(Duration::from_secs(self.timeout), async move {
            tokio::select! {
                _ = async {
                    while !watched.task_state(&task_name).is_terminal() {
                        sleep(Duration::from_millis(25)).await;
                    }
                } => false,
                _ = tokio::signal::ctrl_c() => true,
            }
        })
        .await;
        shutdown.cancel();

        let interrupted = match wait {
            Ok(interrupted) => interrupted,
            Err(_) => bail!("task {} did not finish within {}s", plan.name, self.timeout),
        };
        if interrupted {
            warn!(task = %plan.name, "interrupted; shutting the engine down");
            return Ok(());
        }

        let state = controller.task_state(&plan.name);
        println!("task {} finished: {}", plan.name, state);
        for node in controller.node_statuses(&plan.name) {
            println!(
                "  {:<24} {:<12} {}",
                node.node_name,
                node.state.as_str(),
                node.reason
            );
        }
        if state.is_failure() {
            bail!("task {} failed", plan.name);
        }
        Ok(())
    }
}
