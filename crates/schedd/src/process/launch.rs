//! Supervises scheduler launch sequencing and runtime orchestration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use schedd_config::{RuntimePaths, ServerAddress};

use crate::bootstrap::{ConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::controller::{Controller, ControllerSettings, ExitReason};
use crate::dispatch::CycleRunner;
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::registry::{Connector, RegistrySettings, ServerRegistry, TcpConnector};
use crate::signals::{BlockedSignals, SignalFlags};

use super::PROCESS_TARGET;
use super::crash;
use super::errors::LaunchError;
use super::guard::{HealthState, ProcessGuard};

/// Collaborators required to launch the scheduler.
pub(crate) struct LaunchPlan<R> {
    pub(crate) loader: Arc<dyn ConfigLoader>,
    pub(crate) reporter: Arc<dyn HealthReporter>,
    pub(crate) signals: SignalFlags,
    pub(crate) runner: R,
    /// Installs process-wide signal handlers and the crash guard.
    pub(crate) install_handlers: bool,
    /// Overrides the unbounded multiplexer wait.
    pub(crate) wait_timeout: Option<Duration>,
}

/// Runs the scheduler with the production collaborators.
///
/// Returns once a cycle asks to exit or `SIGINT`/`SIGTERM` arrives. Any
/// startup failure, including a server refusing the registration, is an
/// error.
pub fn run_scheduler<R>(runner: R) -> Result<ExitReason, LaunchError>
where
    R: CycleRunner,
{
    run_scheduler_with(LaunchPlan {
        loader: Arc::new(SystemConfigLoader),
        reporter: Arc::new(StructuredHealthReporter::new()),
        signals: SignalFlags::new(),
        runner,
        install_handlers: true,
        wait_timeout: None,
    })
}

/// Runs the scheduler with injected collaborators.
pub(crate) fn run_scheduler_with<R>(plan: LaunchPlan<R>) -> Result<ExitReason, LaunchError>
where
    R: CycleRunner,
{
    let LaunchPlan {
        loader,
        reporter,
        signals,
        runner,
        install_handlers,
        wait_timeout,
    } = plan;

    crash::record_process_start();
    info!(target: PROCESS_TARGET, "starting scheduler");
    let (config, allow_list) = bootstrap_with(loader.as_ref(), reporter.as_ref())?.into_parts();
    let runtime_paths = RuntimePaths::from_config(&config)?;
    let mut guard = ProcessGuard::acquire(runtime_paths)?;
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthState::Starting)?;

    let _blocked = BlockedSignals::block()?;
    if install_handlers {
        signals.install()?;
        if config.restart_on_crash() {
            crash::install()?;
        }
    }

    let connector = TcpConnector::new(config.scheduler_name(), allow_list);
    let registry_settings = RegistrySettings {
        retry: config.connect_retry(),
        capacity: config.servers().len().max(1),
    };
    let registry = ServerRegistry::new(connector, registry_settings, signals.clone(), reporter)?;
    let controller_settings = ControllerSettings {
        wait_timeout,
        ..ControllerSettings::from_config(&config)
    };
    let mut controller = Controller::new(registry, runner, signals, loader, controller_settings);

    let outcome = serve(&mut controller, &guard, config.servers());
    if let Err(error) = guard.write_health(HealthState::Stopping) {
        warn!(
            target: PROCESS_TARGET,
            error = %error,
            "failed to record stopping state"
        );
    }
    controller.shutdown();
    match &outcome {
        Ok(reason) => info!(
            target: PROCESS_TARGET,
            reason = ?reason,
            "shutdown sequence completed"
        ),
        Err(error) => warn!(
            target: PROCESS_TARGET,
            error = %error,
            "scheduler stopped after a fatal error"
        ),
    }
    outcome
}

fn serve<C, R>(
    controller: &mut Controller<C, R>,
    guard: &ProcessGuard,
    servers: &[ServerAddress],
) -> Result<ExitReason, LaunchError>
where
    C: Connector,
    R: CycleRunner,
{
    controller.start(servers)?;
    guard.write_health(HealthState::Ready)?;
    controller.serve().map_err(LaunchError::from)
}

