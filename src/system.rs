//! System wiring: builds the core services in dependency order and runs
//! the two-phase boot recovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::audit::{AuditStore, JsonlAuditLog};
use crate::config::LabflowConfig;
use crate::dispatch::{DispatchCoordinator, RecoveryReport, SinkRegistry};
use crate::intake::SampleIntake;
use crate::lifecycle::{LifecycleStateMachine, RestoreSummary, SampleRegistry};
use crate::storage::LedgerStorage;
use crate::worklist::WorklistIndex;

/// What the boot recovery brought back.
#[derive(Debug, Clone)]
pub struct BootReport {
    pub restored: RestoreSummary,
    pub recovery: RecoveryReport,
}

/// The assembled core. One registry is the single authority on sample
/// state; everything else either feeds it (intake), drives it (machine),
/// or derives from it (worklist, dispatch feedback).
pub struct LabSystem {
    config: LabflowConfig,
    audit: Arc<dyn AuditStore>,
    index: Arc<WorklistIndex>,
    registry: Arc<SampleRegistry>,
    coordinator: Arc<DispatchCoordinator>,
    machine: Arc<LifecycleStateMachine>,
    intake: Arc<SampleIntake>,
}

impl LabSystem {
    /// Wire the system against the per-channel log sinks. Deployments
    /// register real sinks with `with_sinks`.
    pub fn new(config: LabflowConfig) -> Self {
        Self::with_sinks(config, crate::dispatch::LogSink::registry())
    }

    pub fn with_sinks(config: LabflowConfig, sinks: SinkRegistry) -> Self {
        let storage = Arc::new(LedgerStorage::new(&config.storage.data_dir));
        let audit: Arc<dyn AuditStore> = Arc::new(JsonlAuditLog::new(Arc::clone(&storage)));
        let index = Arc::new(WorklistIndex::new());
        let registry = Arc::new(SampleRegistry::new(
            Arc::clone(&audit),
            Arc::clone(&index),
            Arc::clone(&storage),
        ));
        let coordinator = Arc::new(DispatchCoordinator::new(
            Arc::clone(&registry),
            sinks,
            Arc::clone(&storage),
            Arc::clone(&audit),
            config.dispatch.retry.policy(),
            Duration::from_secs(config.dispatch.sink_timeout_seconds),
        ));
        let machine = Arc::new(LifecycleStateMachine::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            Arc::clone(&storage),
            config.dispatch.auto_dispatch,
        ));
        let intake = Arc::new(SampleIntake::new(Arc::clone(&registry), storage));

        Self {
            config,
            audit,
            index,
            registry,
            coordinator,
            machine,
            intake,
        }
    }

    /// Two-phase boot: lifecycle state first so dispatch recovery can
    /// judge every stored intent against the sample's restored stage,
    /// then delivery replay, which re-arms the retry timers.
    pub async fn boot(&self) -> Result<BootReport> {
        let restored = self.machine.restore().await?;
        let recovery = self.coordinator.recover().await?;
        info!(
            samples = restored.samples,
            reports = restored.reports,
            retries_resumed = recovery.retries_resumed,
            "Labflow core ready"
        );
        Ok(BootReport { restored, recovery })
    }

    pub fn config(&self) -> &LabflowConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn index(&self) -> &Arc<WorklistIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<SampleRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<DispatchCoordinator> {
        &self.coordinator
    }

    pub fn machine(&self) -> &Arc<LifecycleStateMachine> {
        &self.machine
    }

    pub fn intake(&self) -> &Arc<SampleIntake> {
        &self.intake
    }
}
