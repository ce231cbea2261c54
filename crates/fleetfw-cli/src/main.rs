mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(code) => std::process::exit(code),
    };
    let stack = match commands::build_stack(config) {
        Ok(stack) => stack,
        Err(e) => {
            eprintln!("startup error: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve { bind, token, hosts } => commands::serve(stack, bind, token, hosts).await,
        Command::Apply { plan, hosts, dry_run } => {
            commands::apply(stack, plan, hosts, dry_run).await
        }
        Command::Status { plan_id } => commands::status(stack, plan_id).await,
        Command::Discover {
            host_id,
            username,
            password,
            endpoint,
        } => commands::discover(stack, host_id, username, password, endpoint).await,
        Command::Cancel { run_id } => commands::cancel(stack, run_id).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}
