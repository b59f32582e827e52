use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleet-deploy-manager", about = "Fleet deployment orchestrator")]
pub struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print resolved configuration and exit.
    #[arg(long)]
    pub print_debug_info: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the manager and wait for update notifications.
    Run,
    /// Clear an agent's auth backoff/circuit-breaker state.
    ResetCircuit {
        /// Agent id of the composite key to reset.
        agent_id: String,
        #[arg(long)]
        occurrence_id: Option<String>,
        #[arg(long, default_value = "main")]
        server_id: String,
    },
    /// Execute a stored rollback proposal for a prior deployment.
    Rollback {
        deployment_id: String,
        /// 0 = current, 1 = previous, 2 = before-previous.
        slot: u8,
    },
}

pub fn init_cli() -> Cli {
    Cli::parse()
}
