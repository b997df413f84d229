//! The scheduler's main loop.
//!
//! The controller connects every configured server, then alternates between
//! parking in the multiplexer until a command socket is readable and draining
//! the queue one cycle at a time. Operator signals are only acted on between
//! cycles.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::SigSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use schedd_config::{Config, ServerAddress};

use crate::bootstrap::{ConfigLoader, build_allow_list};
use crate::command::{Command, CommandKind, ConnectionId};
use crate::dispatch::{CycleRunner, DispatchError, DispatchStep, Dispatcher};
use crate::multiplexer::Readiness;
use crate::queue::{CommandQueue, read_one_or_more};
use crate::registry::{Connector, RegistryError, ServerRegistry};
use crate::signals::{SignalFlags, deliver_pending_signals, sleep_with_signals_open};

const CONTROLLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::controller");

/// Why the main loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A cycle asked the scheduler to exit.
    CycleRequestedExit,
    /// `SIGINT` or `SIGTERM` was received.
    Signalled,
}

/// Errors that end the main loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A server could not be connected at startup.
    #[error("failed to connect to configured servers: {source}")]
    Startup {
        /// Underlying registry error.
        #[source]
        source: RegistryError,
    },
    /// A failed connection could not be rebuilt.
    #[error("failed to reconnect to {address}: {source}")]
    Reconnect {
        /// Server address.
        address: String,
        /// Underlying registry error.
        #[source]
        source: RegistryError,
    },
    /// Dispatching a command failed.
    #[error("command dispatch failed: {source}")]
    Dispatch {
        /// Underlying dispatch error.
        #[source]
        source: DispatchError,
    },
}

/// Timing knobs for the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Longest single multiplexer wait; `None` waits until something happens.
    pub wait_timeout: Option<Duration>,
    /// Pause after a failed multiplexer wait.
    pub wait_error_backoff: Duration,
}

impl ControllerSettings {
    /// Settings for a production scheduler.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            wait_timeout: None,
            wait_error_backoff: config.wait_error_backoff(),
        }
    }
}

/// Owns the registry, the queue and the dispatcher, and drives them.
pub struct Controller<C, R> {
    registry: ServerRegistry<C>,
    queue: CommandQueue,
    dispatcher: Dispatcher<R>,
    signals: SignalFlags,
    loader: Arc<dyn ConfigLoader>,
    settings: ControllerSettings,
    closed: bool,
}

impl<C, R> Controller<C, R>
where
    C: Connector,
    R: CycleRunner,
{
    /// Assembles a controller around an empty registry.
    pub fn new(
        registry: ServerRegistry<C>,
        runner: R,
        signals: SignalFlags,
        loader: Arc<dyn ConfigLoader>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            queue: CommandQueue::new(),
            dispatcher: Dispatcher::new(runner),
            signals,
            loader,
            settings,
            closed: false,
        }
    }

    /// Connects every server. Any failure here is fatal.
    pub fn start(&mut self, servers: &[ServerAddress]) -> Result<(), ControllerError> {
        self.registry
            .connect_all(servers)
            .map_err(|source| ControllerError::Startup { source })?;
        info!(
            target: CONTROLLER_TARGET,
            servers = self.registry.len(),
            "all servers connected"
        );
        Ok(())
    }

    /// Runs until a cycle asks to exit or shutdown is requested.
    pub fn serve(&mut self) -> Result<ExitReason, ControllerError> {
        loop {
            if let Some(reason) = self.poll_once()? {
                return Ok(reason);
            }
        }
    }

    /// One pass of the main loop: signals, one wait, then the queue.
    pub fn poll_once(&mut self) -> Result<Option<ExitReason>, ControllerError> {
        if let Some(reason) = self.service_signals() {
            return Ok(Some(reason));
        }
        self.wait_for_commands()?;
        self.drain_queue()
    }

    /// Acts on pending operator signals.
    ///
    /// Signals held back by the mask during the last cycle are let through
    /// first. Returns `Some` once shutdown has been requested.
    pub fn service_signals(&mut self) -> Option<ExitReason> {
        deliver_pending_signals();
        if self.signals.terminate_requested() {
            info!(target: CONTROLLER_TARGET, "shutdown requested");
            return Some(ExitReason::Signalled);
        }
        if self.signals.take_reconfigure() {
            self.reconfigure();
        }
        if self.signals.take_diagnostics_toggle() {
            self.dispatcher.toggle_diagnostics();
        }
        None
    }

    /// Blocks until at least one command socket is ready, then reads it.
    ///
    /// An interrupted wait returns at once so signals can be inspected. Other
    /// multiplexer failures are logged and followed by a short pause.
    pub fn wait_for_commands(&mut self) -> Result<(), ControllerError> {
        let ready = match self
            .registry
            .wait(self.settings.wait_timeout, &SigSet::empty())
        {
            Ok(ready) => ready,
            Err(error) if error.is_interrupted() => {
                debug!(target: CONTROLLER_TARGET, "wait interrupted by signal");
                return Ok(());
            }
            Err(error) => {
                warn!(
                    target: CONTROLLER_TARGET,
                    error = %error,
                    backoff_ms = self.settings.wait_error_backoff.as_millis(),
                    "command wait failed"
                );
                sleep_with_signals_open(self.settings.wait_error_backoff);
                return Ok(());
            }
        };
        for readiness in ready {
            self.read_ready(readiness)?;
        }
        Ok(())
    }

    /// Dispatches queued commands until the queue empties or the loop must
    /// stop.
    pub fn drain_queue(&mut self) -> Result<Option<ExitReason>, ControllerError> {
        loop {
            if let Some(reason) = self.service_signals() {
                return Ok(Some(reason));
            }
            let step = match self
                .dispatcher
                .dispatch_next(&mut self.registry, &mut self.queue)
            {
                Ok(step) => step,
                Err(DispatchError::Reconnect { source }) if source.is_cancelled() => continue,
                Err(source) => return Err(ControllerError::Dispatch { source }),
            };
            match step {
                DispatchStep::Empty => return Ok(None),
                DispatchStep::Exit(_) => return Ok(Some(ExitReason::CycleRequestedExit)),
                DispatchStep::Dropped(_) | DispatchStep::Completed { .. } => {}
            }
        }
    }

    /// Closes every server and drains the queue, once.
    ///
    /// Returns the number of commands discarded.
    pub fn shutdown(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        let dropped = self.registry.close_all(&mut self.queue);
        info!(
            target: CONTROLLER_TARGET,
            dropped_commands = dropped,
            "scheduler shut down"
        );
        dropped
    }

    /// The server registry.
    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry<C> {
        &self.registry
    }

    /// The server registry, mutably.
    pub const fn registry_mut(&mut self) -> &mut ServerRegistry<C> {
        &mut self.registry
    }

    /// Commands awaiting dispatch.
    #[must_use]
    pub const fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Commands awaiting dispatch, mutably.
    pub const fn queue_mut(&mut self) -> &mut CommandQueue {
        &mut self.queue
    }

    /// The cycle dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher<R> {
        &self.dispatcher
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.closed
    }

    fn read_ready(&mut self, readiness: Readiness) -> Result<(), ControllerError> {
        let Some(id) = self.registry.find_by_descriptor(readiness.fd()) else {
            debug!(
                target: CONTROLLER_TARGET,
                fd = readiness.fd(),
                "readiness for a descriptor no longer registered"
            );
            return Ok(());
        };
        let Some(connection) = self.registry.get_mut(id) else {
            return Ok(());
        };
        match read_one_or_more(connection, &mut self.queue) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(
                    target: CONTROLLER_TARGET,
                    server = %connection.address(),
                    connection = %id,
                    fd = readiness.fd(),
                    error = %error,
                    "command read failed"
                );
                self.reconnect(id)
            }
        }
    }

    fn reconnect(&mut self, id: ConnectionId) -> Result<(), ControllerError> {
        let address = self
            .registry
            .get(id)
            .map(|connection| connection.address().to_string())
            .unwrap_or_default();
        match self.registry.reconnect_server(id) {
            Ok(_) => Ok(()),
            Err(source) if source.is_cancelled() => Ok(()),
            Err(source) => Err(ControllerError::Reconnect { address, source }),
        }
    }

    fn reconfigure(&mut self) {
        info!(target: CONTROLLER_TARGET, "reconfiguration requested");
        match self.loader.load() {
            Ok(config) => match build_allow_list(&config) {
                Ok(allow_list) => {
                    self.registry.connector_mut().update_allow_list(allow_list);
                    self.settings.wait_error_backoff = config.wait_error_backoff();
                    self.dispatcher.runner_mut().reconfigure(&config);
                    info!(
                        target: CONTROLLER_TARGET,
                        scheduler = %config.scheduler_name(),
                        "configuration reloaded"
                    );
                }
                Err(failure) => error!(
                    target: CONTROLLER_TARGET,
                    error = %failure,
                    "reloaded client allow-list is invalid; keeping the previous one"
                ),
            },
            Err(failure) => error!(
                target: CONTROLLER_TARGET,
                error = %failure,
                "failed to reload configuration; keeping the previous one"
            ),
        }
        self.queue
            .enqueue_front(Command::internal(CommandKind::Configure));
    }
}
