use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetshell::cli::{handlers, Cli, Commands};
use fleetshell::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they never interleave with shell output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetshell=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Agents {
            text,
            status,
            page,
            size,
        } => handlers::list_agents(config, text, status, page, size).await,
        Commands::Variants => handlers::list_variants(config).await,
        Commands::Shell { agent, cmd } => handlers::open_shell(config, agent, cmd).await,
        Commands::Passive { command } => handlers::handle_passive_command(config, command).await,
    }
}
