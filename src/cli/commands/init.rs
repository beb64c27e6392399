use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::FleetConfig;

pub struct InitCommand {
    pub path: PathBuf,
    pub force: bool,
}

impl InitCommand {
    pub fn new(path: PathBuf, force: bool) -> Self {
        Self { path, force }
    }

    pub async fn execute(&self) -> Result<()> {
        if self.path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to overwrite it",
                self.path.display()
            );
        }

        let config = FleetConfig::default();
        config.save_to_file(&self.path)?;
        std::fs::create_dir_all(&config.workflows.dir)?;

        println!("⚙️  Wrote {}", self.path.display());
        println!("   Coordination store: {}", config.store.root.display());
        println!("   Workflow directory: {}", config.workflows.dir.display());
        Ok(())
    }
}
