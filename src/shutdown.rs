use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::dispatch::DispatchCoordinator;

/// Graceful shutdown coordinator for Labflow
pub struct ShutdownCoordinator {
    coordinator: Arc<DispatchCoordinator>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self {
            coordinator,
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Wait for SIGINT/SIGTERM, then drain and shut down.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT/SIGTERM");

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("SIGINT received");
        }

        self.shutdown_all_services().await
    }

    /// Drain delivery work. Retry timers are only in-memory schedules
    /// over the ledgers, so halting them loses nothing; recovery re-arms
    /// them on the next start. In-flight sink calls get a grace period
    /// to record their outcome.
    pub async fn shutdown_all_services(&self) -> Result<()> {
        info!("Initiating graceful shutdown of all services...");

        let halted = self.coordinator.halt_retries();
        info!(
            halted_timers = halted,
            "Retry timers halted; pending retries rebuild from the ledgers on restart"
        );

        tokio::time::sleep(self.grace).await;

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
