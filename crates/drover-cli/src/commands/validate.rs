use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::plan::TaskPlan;

#[derive(Args)]
pub struct Validate {
    /// Task plan YAML file
    #[arg(value_name = "PLAN_FILE")]
    pub plan: PathBuf,
}

impl Validate {
    pub fn execute(self) -> Result<()> {
        let plan = TaskPlan::load(&self.plan)?;
        println!(
            "plan '{}' is valid: type {}, {} node(s), concurrency {}, tolerance {}",
            plan.name,
            plan.task_type,
            plan.nodes.len(),
            plan.concurrency,
            plan.failure_tolerate
        );
        Ok(())
    }
}
