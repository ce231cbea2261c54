use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "fleetfw",
    about = "Fleet firmware orchestration for Dell PowerEdge iDRACs",
    version
)]
pub struct Cli {
    /// Orchestrator config file (YAML). Defaults apply when absent.
    #[arg(long, env = "FLEETFW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the admin API and the host-run scheduler.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8470")]
        bind: String,

        /// Bearer token required by every API request.
        #[arg(long, env = "FLEETFW_TOKEN")]
        token: String,

        /// Host inventory file registered at startup.
        #[arg(long)]
        hosts: Option<PathBuf>,
    },

    /// Execute a plan file locally and wait for every host-run to finish.
    Apply {
        /// Plan file (YAML).
        plan: PathBuf,

        /// Host inventory file covering the plan targets.
        #[arg(long)]
        hosts: PathBuf,

        /// List the targets without enqueuing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show host-run records for a plan.
    Status {
        plan_id: String,
    },

    /// Probe a host's management protocols with one-off credentials.
    Discover {
        host_id: String,

        #[arg(short = 'u', long)]
        username: String,

        #[arg(short = 'p', long, env = "FLEETFW_PASSWORD")]
        password: String,

        /// Management endpoint, required when the host is not in the store.
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Request cancellation of a host-run.
    Cancel {
        run_id: Uuid,
    },
}
