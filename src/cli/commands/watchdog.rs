use anyhow::Result;

use crate::config::FleetConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::watchdog::{report_suspect, Watchdog, WatchdogLock};

pub struct WatchdogCommand {
    pub once: bool,
}

impl WatchdogCommand {
    pub fn new(once: bool) -> Self {
        Self { once }
    }

    pub async fn execute(&self, config: &FleetConfig, shutdown: &ShutdownCoordinator) -> Result<()> {
        let watchdog = Watchdog::from_config(config);

        if self.once {
            let suspects = watchdog.scan().await?;
            if suspects.is_empty() {
                println!("✅ All heartbeats are fresh");
            }
            for suspect in &suspects {
                report_suspect(suspect);
                println!(
                    "🔴 {} ({}) pid {} silent for {}s, last task: {}",
                    suspect.name,
                    suspect.layer,
                    suspect.pid,
                    suspect.elapsed.as_secs(),
                    suspect.last_task.as_deref().unwrap_or("-")
                );
            }
            return Ok(());
        }

        let mut lock = WatchdogLock::open(&config.watchdog.lock_file)?;
        let _guard = lock.try_guard()?;
        println!(
            "🐕 Watchdog running (timeout {}s, lock {})",
            watchdog.timeout().as_secs(),
            config.watchdog.lock_file.display()
        );

        let scans = watchdog.run(shutdown.token()).await;
        println!("🛑 Watchdog stopped after {scans} scans");
        Ok(())
    }
}
