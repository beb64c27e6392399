use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator: turns SIGINT/SIGTERM into a cancelled token.
///
/// Agent runtimes observe the token between workflow steps, so a signal lets
/// the current step finish before the agent goes idle.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    /// Install signal handlers for graceful shutdown
    pub fn install_signal_handlers(&self) -> Result<()> {
        info!("Installing signal handlers for graceful shutdown");

        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let coordinator = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let terminated = terminate.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for ctrl-c");
                        return;
                    }
                    info!(signal = "SIGINT", "Signal received");
                }
                _ = terminated => {
                    info!(signal = "SIGTERM", "Signal received");
                }
                _ = coordinator.token.cancelled() => return,
            }
            coordinator.trigger();
        });

        Ok(())
    }

    /// Wait until shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}
