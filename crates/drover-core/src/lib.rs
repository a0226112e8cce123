pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod message;
pub mod registry;
pub mod worker;

mod watcher;

pub use config::EngineConfig;
pub use controller::{ControllerRegistry, StageController};
pub use error::{EngineError, EngineResult};
pub use executor::Executor;
pub use registry::ExecutorRegistry;
