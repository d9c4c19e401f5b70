use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::{AgentStatus, PassiveAgentId};

#[derive(Parser, Debug)]
#[command(name = "fleetshell")]
#[command(about = "Interactive shells on remote fleet agents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file to use instead of the per-user default
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List agents known to the console
    Agents {
        /// Match against id, name, address, hostname, os or arch
        #[arg(short, long)]
        text: Option<String>,
        /// Only show agents in these states (offline, online, updating)
        #[arg(short, long)]
        status: Vec<AgentStatus>,
        #[arg(long, default_value = "1")]
        page: usize,
        /// Page size; defaults to the configured directory page size
        #[arg(long)]
        size: Option<usize>,
    },
    /// Show the shell variants operators may request
    Variants,
    /// Open an interactive shell on an agent (Ctrl-] detaches)
    Shell {
        /// Agent id or name
        agent: String,
        /// Shell variant to launch
        #[arg(short, long, default_value = "bash")]
        cmd: String,
    },
    /// Manage agents the gateway dials out to
    Passive {
        #[command(subcommand)]
        command: PassiveCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PassiveCommands {
    /// List passive agents, newest first
    List {
        #[arg(short, long)]
        text: Option<String>,
        #[arg(long, default_value = "1")]
        page: usize,
        /// Page size; defaults to the configured directory page size
        #[arg(long)]
        size: Option<usize>,
    },
    /// Register a passive agent
    Add {
        name: String,
        /// host:port the agent listens on
        address: String,
        /// Seconds between dial attempts; 0 means manual activation only
        #[arg(short, long, default_value = "0")]
        retry_time: i64,
    },
    /// Change a passive agent's name, address or retry interval
    Update {
        id: PassiveAgentId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        retry_time: Option<i64>,
    },
    /// Remove one or more passive agents
    Delete {
        #[arg(required = true)]
        ids: Vec<PassiveAgentId>,
    },
    /// Dial a passive agent now
    Activate { id: PassiveAgentId },
    /// Dial the passive agents from the config file until interrupted
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_agents_status_filter_accepts_names_and_codes() {
        let cli = Cli::try_parse_from(["fleetshell", "agents", "-s", "online", "-s", "2"]).unwrap();
        match cli.command {
            Commands::Agents {
                status, page, size, ..
            } => {
                assert_eq!(status, vec![AgentStatus::Online, AgentStatus::Updating]);
                assert_eq!(page, 1);
                assert_eq!(size, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_shell_defaults_to_bash() {
        let cli = Cli::try_parse_from(["fleetshell", "shell", "edge-1"]).unwrap();
        match cli.command {
            Commands::Shell { agent, cmd } => {
                assert_eq!(agent, "edge-1");
                assert_eq!(cmd, "bash");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_passive_delete_requires_an_id() {
        assert!(Cli::try_parse_from(["fleetshell", "passive", "delete"]).is_err());
        assert!(Cli::try_parse_from(["fleetshell", "passive", "delete", "not-a-uuid"]).is_err());

        let id = PassiveAgentId::new();
        let cli =
            Cli::try_parse_from(["fleetshell", "passive", "delete", &id.to_string()]).unwrap();
        match cli.command {
            Commands::Passive {
                command: PassiveCommands::Delete { ids },
            } => assert_eq!(ids, vec![id]),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
