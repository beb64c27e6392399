use anyhow::Result;

pub mod agent;
pub mod fleet;
pub mod init;
pub mod status;
pub mod watchdog;

pub use agent::AgentCommand;
pub use fleet::FleetCommand;
pub use init::InitCommand;
pub use status::StatusCommand;
pub use watchdog::WatchdogCommand;

pub async fn show_getting_started() -> Result<()> {
    println!("🤖 agent-fleet - file-coordinated test agents");
    println!();
    println!("To get started:");
    println!("  ⚙️  agent-fleet init              # Write agent-fleet.toml with defaults");
    println!("  🚀 agent-fleet agent ui-core     # Run one agent");
    println!("  🚢 agent-fleet fleet             # Run every configured agent");
    println!("  📊 agent-fleet status            # Fleet overview");
    println!("  🐕 agent-fleet watchdog          # Report agents with stale heartbeats");
    println!();
    println!("💡 Workflows are read from the directory set in [workflows] dir.");
    Ok(())
}
