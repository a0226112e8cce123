mod run;
mod validate;

pub use run::Run;
pub use validate::Validate;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check a task plan file without executing it
    Validate(Validate),

    /// Execute a task plan against a simulated fleet
    Run(Run),
}
