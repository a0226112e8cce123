use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no controller registered for task type '{task_type}'")]
    UnknownTaskType { task_type: String },

    #[error("task {task} has no node to operate on")]
    NoCandidateNodes { task: String },

    #[error("workers are stopped")]
    WorkersStopped,

    #[error("workers are all running, {inflight}/{capacity}")]
    WorkersFull { inflight: usize, capacity: usize },

    #[error("end job {node} error, job not in flight")]
    UnknownJob { node: String },

    #[error(
        "the number of failed nodes is {failed}/{total}, which exceeds the failure tolerance threshold"
    )]
    ToleranceExceeded { failed: usize, total: usize },

    #[error("executor is unavailable")]
    ExecutorUnavailable,
}

pub type EngineResult<T> = Result<T, EngineError>;
