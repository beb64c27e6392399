use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use agent_fleet::cli::commands::{
    show_getting_started, AgentCommand, FleetCommand, InitCommand, StatusCommand, WatchdogCommand,
};
use agent_fleet::cli::{Cli, Commands};
use agent_fleet::{init_telemetry, FleetConfig, ShutdownCoordinator};

fn main() -> Result<()> {
    let Cli {
        config: config_path,
        log_level,
        command,
    } = Cli::parse();

    if let Err(e) = FleetConfig::load_env_file() {
        eprintln!("⚠️  Ignoring unreadable .env file: {e}");
    }
    let config = FleetConfig::load(config_path.as_deref())?;
    let level = log_level.unwrap_or_else(|| config.observability.log_level.clone());

    tokio::runtime::Runtime::new()?.block_on(async {
        init_telemetry(&level)?;
        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers()?;

        match command {
            // Default behavior: no subcommand - explain how to get started
            None => show_getting_started().await,
            Some(Commands::Agent {
                name,
                layer,
                repeat,
                fix,
            }) => {
                AgentCommand::new(name)
                    .with_layer(layer)
                    .with_repeat(repeat.map(Duration::from_secs))
                    .with_fix(fix)
                    .execute(&config, &shutdown)
                    .await
            }
            Some(Commands::Fleet { agents }) => {
                FleetCommand::new(agents, config_path)
                    .execute(&config, &shutdown)
                    .await
            }
            Some(Commands::Status { json }) => {
                StatusCommand::new().with_json(json).execute(&config).await
            }
            Some(Commands::Watchdog { once }) => {
                WatchdogCommand::new(once).execute(&config, &shutdown).await
            }
            Some(Commands::Init { path, force }) => InitCommand::new(path, force).execute().await,
        }
    })
}
