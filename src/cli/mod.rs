use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::registry::Layer;

pub mod commands;

#[derive(Parser)]
#[command(name = "agent-fleet")]
#[command(about = "File-coordinated fleet of autonomous test agents")]
#[command(long_about = "agent-fleet runs independent test agents that share a coordination \
                       directory instead of a broker or database. Agents register their status, \
                       heartbeat, lease ports and report failures through locked atomic updates. \
                       Start one with 'agent-fleet agent ui-core' or the whole fleet with 'agent-fleet fleet'.")]
pub struct Cli {
    /// Configuration file layered over agent-fleet.toml and the defaults
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one named agent until its workflows finish or it is interrupted
    Agent {
        /// Agent name, e.g. ui-core or api-core-agent
        name: String,
        /// Layer override when the name does not start with one
        #[arg(long, help = "ui, api, integration or oversight")]
        layer: Option<Layer>,
        /// Re-run the partition every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        repeat: Option<u64>,
        /// After each run, claim failures from this agent's layer and attempt fixes
        #[arg(long)]
        fix: bool,
    },
    /// Start every configured agent as its own process, staggered
    Fleet {
        /// Agents to start instead of the configured list
        #[arg(long, value_delimiter = ',', value_name = "NAMES")]
        agents: Vec<String>,
    },
    /// Show agent status, failure queue and recent merges
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Watch agent heartbeats and report stale ones
    Watchdog {
        /// Run a single scan and exit
        #[arg(long)]
        once: bool,
    },
    /// Write a configuration file with the default settings
    Init {
        /// Where to write the file
        #[arg(long, default_value = "agent-fleet.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_agent_with_layer_override() {
        let cli = Cli::try_parse_from([
            "agent-fleet",
            "--config",
            "fleet.toml",
            "agent",
            "pricing-bot",
            "--layer",
            "api",
            "--repeat",
            "60",
            "--fix",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("fleet.toml")));
        match cli.command {
            Some(Commands::Agent {
                name,
                layer,
                repeat,
                fix,
            }) => {
                assert_eq!(name, "pricing-bot");
                assert_eq!(layer, Some(Layer::Api));
                assert_eq!(repeat, Some(60));
                assert!(fix);
            }
            _ => panic!("expected agent command"),
        }
    }

    #[test]
    fn test_parse_fleet_agent_list_and_bad_layer() {
        let cli = Cli::try_parse_from(["agent-fleet", "fleet", "--agents", "ui-core,api-core"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Fleet { ref agents }) if agents == &["ui-core", "api-core"]
        ));

        assert!(Cli::try_parse_from(["agent-fleet", "agent", "x", "--layer", "database"]).is_err());
    }
}
