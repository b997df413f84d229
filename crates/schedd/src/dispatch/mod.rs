//! Cycle dispatch: pops one command at a time and runs a cycle for it.
//!
//! The dispatcher is a three-state machine. It leaves `Idle` only when the
//! queue yields a command whose server is still connected, runs exactly one
//! cycle with the operator signals blocked, reports completion on the
//! originating command socket, and either returns to `Idle` or stops for
//! good in `Terminated`.

mod runner;

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::write_cycle_end;
use crate::command::{Command, ConnectionId, Origin};
use crate::process::crash;
use crate::queue::CommandQueue;
use crate::registry::{Connector, RegistryError, ServerRegistry};
use crate::signals::{BlockedSignals, SignalError};

pub use runner::{CycleRunner, CycleVerdict, LoggingCycleRunner};

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Where the dispatcher is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for a command.
    Idle,
    /// A cycle is in progress.
    Running,
    /// A cycle asked to stop; nothing more is dispatched.
    Terminated,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Terminated => "terminated",
        })
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug)]
pub enum DispatchStep {
    /// The queue was empty.
    Empty,
    /// The command's server had gone away; the command was discarded.
    Dropped(Command),
    /// A cycle ran and the scheduler keeps serving.
    Completed {
        /// The command the cycle ran for.
        command: Command,
        /// Whether the completion marker reached the server.
        acknowledged: bool,
    },
    /// A cycle asked the scheduler to stop.
    Exit(Command),
}

/// Errors that stop dispatching altogether.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The operator signals could not be blocked around a cycle.
    #[error("failed to block signals for cycle: {source}")]
    Signals {
        /// Underlying signal error.
        #[source]
        source: SignalError,
    },
    /// Rebuilding a connection after a failed acknowledgement failed fatally.
    #[error("failed to reconnect after completion marker: {source}")]
    Reconnect {
        /// Underlying registry error.
        #[source]
        source: RegistryError,
    },
}

/// Runs cycles for queued commands one at a time.
#[derive(Debug)]
pub struct Dispatcher<R> {
    runner: R,
    state: DispatcherState,
    diagnostics: bool,
}

impl<R> Dispatcher<R>
where
    R: CycleRunner,
{
    /// Wraps `runner` in an idle dispatcher.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self {
            runner,
            state: DispatcherState::Idle,
            diagnostics: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DispatcherState {
        self.state
    }

    /// Whether a cycle has asked the scheduler to stop.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self.state, DispatcherState::Terminated)
    }

    /// Whether diagnostic recording is on.
    #[must_use]
    pub const fn diagnostics(&self) -> bool {
        self.diagnostics
    }

    /// The wrapped runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// The wrapped runner, mutably.
    pub const fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    /// Flips diagnostic recording and tells the runner.
    pub fn toggle_diagnostics(&mut self) -> bool {
        self.diagnostics = !self.diagnostics;
        self.runner.set_diagnostics(self.diagnostics);
        info!(
            target: DISPATCH_TARGET,
            enabled = self.diagnostics,
            "diagnostic recording toggled"
        );
        self.diagnostics
    }

    /// Dispatches the oldest queued command, if any.
    ///
    /// Commands from a connection that has since been closed or rebuilt are
    /// dropped. When the cycle continues, a completion marker is written to
    /// the originating command socket and a failed write rebuilds that
    /// connection.
    pub fn dispatch_next<C>(
        &mut self,
        registry: &mut ServerRegistry<C>,
        queue: &mut CommandQueue,
    ) -> Result<DispatchStep, DispatchError>
    where
        C: Connector,
    {
        if self.is_terminated() {
            return Ok(DispatchStep::Empty);
        }
        let Some(command) = queue.dequeue() else {
            return Ok(DispatchStep::Empty);
        };
        let server = match command.origin() {
            Origin::Server(id) if registry.get(id).is_none() => {
                debug!(
                    target: DISPATCH_TARGET,
                    connection = %id,
                    command = %command.kind(),
                    job_id = command.job_id().unwrap_or_default(),
                    "dropping command from closed connection"
                );
                return Ok(DispatchStep::Dropped(command));
            }
            Origin::Server(id) => Some(id),
            Origin::Internal => None,
        };

        let verdict = self.run(registry, server, &command)?;
        match verdict {
            CycleVerdict::Exit => {
                self.state = DispatcherState::Terminated;
                info!(
                    target: DISPATCH_TARGET,
                    command = %command.kind(),
                    "cycle requested scheduler exit"
                );
                Ok(DispatchStep::Exit(command))
            }
            CycleVerdict::Continue => {
                self.state = DispatcherState::Idle;
                let acknowledged = match server {
                    Some(id) => acknowledge(registry, id)?,
                    None => true,
                };
                Ok(DispatchStep::Completed {
                    command,
                    acknowledged,
                })
            }
        }
    }

    fn run<C>(
        &mut self,
        registry: &mut ServerRegistry<C>,
        server: Option<ConnectionId>,
        command: &Command,
    ) -> Result<CycleVerdict, DispatchError>
    where
        C: Connector,
    {
        let _blocked = BlockedSignals::block().map_err(|source| DispatchError::Signals { source })?;
        self.state = DispatcherState::Running;
        crash::record_cycle_start();
        let connection = server.and_then(|id| registry.get_mut(id));
        Ok(self.runner.run_cycle(connection, command))
    }
}

/// Writes the completion marker, rebuilding the connection if it fails.
fn acknowledge<C>(
    registry: &mut ServerRegistry<C>,
    id: ConnectionId,
) -> Result<bool, DispatchError>
where
    C: Connector,
{
    let Some(connection) = registry.get_mut(id) else {
        return Ok(false);
    };
    match write_cycle_end(connection.secondary_mut()) {
        Ok(()) => Ok(true),
        Err(error) => {
            warn!(
                target: DISPATCH_TARGET,
                server = %connection.address(),
                connection = %id,
                fd = connection.secondary_fd(),
                error = %error,
                "failed to send completion marker"
            );
            registry
                .reconnect_server(id)
                .map_err(|source| DispatchError::Reconnect { source })?;
            Ok(false)
        }
    }
}
