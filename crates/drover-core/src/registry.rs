//! Process-wide executor registry and the task ingress loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::controller::ControllerRegistry;
use crate::executor::Executor;
use crate::message::{NodeCommand, TaskMessage};

/// Owns every live executor, keyed by `(type, name)`. Ingress task messages
/// are fanned into the owning executor's status channel; shutdown-flagged
/// messages remove the entry.
pub struct ExecutorRegistry {
    executors: Mutex<HashMap<String, Arc<Executor>>>,
    controllers: Arc<ControllerRegistry>,
    downstream: mpsc::Sender<NodeCommand>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl ExecutorRegistry {
    pub fn new(
        controllers: Arc<ControllerRegistry>,
        downstream: mpsc::Sender<NodeCommand>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            executors: Mutex::new(HashMap::new()),
            controllers,
            downstream,
            config,
            shutdown,
        })
    }

    /// Spawn the ingress loop over the task message stream.
    pub fn start(self: &Arc<Self>, messages: mpsc::Receiver<TaskMessage>) -> JoinHandle<()> {
        info!("start executor registry");
        let registry = Arc::clone(self);
        tokio::spawn(registry.sync_tasks(messages))
    }

    async fn sync_tasks(self: Arc<Self>, mut messages: mpsc::Receiver<TaskMessage>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("stop syncing tasks");
                    return;
                }
                message = messages.recv() => {
                    let Some(message) = message else { return };
                    if message.shutdown {
                        warn!(task = %message.key(), "removing executor");
                        self.remove(&message);
                        continue;
                    }
                    let executor = match self.get_or_create(&message).await {
                        Ok(executor) => executor,
                        Err(err) => {
                            error!(task = %message.key(), error = %err, "executor init failed");
                            continue;
                        }
                    };
                    if let Err(err) = executor.handle_message(message.status.clone()).await {
                        error!(task = %message.key(), error = %err, "failed to deliver status report");
                    }
                }
            }
        }
    }

    /// Look up the executor for a task, creating and starting it on first
    /// sight of the key.
    pub async fn get_or_create(self: &Arc<Self>, message: &TaskMessage) -> Result<Arc<Executor>> {
        if let Some(executor) = self.get(&message.key()) {
            return Ok(executor);
        }
        self.init_executor(message).await
    }

    pub fn get(&self, key: &str) -> Option<Arc<Executor>> {
        self.lock_executors().get(key).cloned()
    }

    pub fn remove(&self, task: &TaskMessage) {
        self.lock_executors().remove(&task.key());
    }

    pub fn is_empty(&self) -> bool {
        self.lock_executors().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock_executors().len()
    }

    async fn init_executor(self: &Arc<Self>, message: &TaskMessage) -> Result<Arc<Executor>> {
        let controller = self.controllers.resolve(&message.task_type)?;
        let (executor, status_rx) = Executor::init(
            message.clone(),
            controller,
            self.downstream.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        )
        .await?;

        {
            let mut executors = self.lock_executors();
            // A racing creation for the same key wins; drop ours unstarted.
            if let Some(existing) = executors.get(&message.key()) {
                return Ok(Arc::clone(existing));
            }
            executors.insert(message.key(), Arc::clone(&executor));
        }

        tokio::spawn(Arc::clone(&executor).run(status_rx, Arc::clone(self)));
        info!(task = %message.key(), "started executor");
        Ok(executor)
    }

    fn lock_executors(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Executor>>> {
        self.executors.lock().expect("executor registry lock poisoned")
    }
}
