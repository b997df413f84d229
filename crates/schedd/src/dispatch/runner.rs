//! The hook into the placement algorithm.

use schedd_config::Config;
use tracing::info;

use crate::command::{Command, CommandKind};
use crate::registry::ServerConnection;

use super::DISPATCH_TARGET;

/// What the dispatcher should do once a cycle returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    /// Report completion to the server and keep serving.
    Continue,
    /// Stop dispatching and shut the scheduler down.
    Exit,
}

/// Runs one scheduling cycle for a command.
///
/// Cycles run one at a time on the dispatcher thread. Implementations may
/// use the server's primary socket to query state or submit requests.
pub trait CycleRunner {
    /// Runs a cycle. `server` is `None` for commands the scheduler raised
    /// itself.
    fn run_cycle(&mut self, server: Option<&mut ServerConnection>, command: &Command)
    -> CycleVerdict;

    /// Switches optional diagnostic recording on or off.
    fn set_diagnostics(&mut self, _enabled: bool) {}

    /// Receives the configuration reloaded after `SIGHUP`.
    fn reconfigure(&mut self, _config: &Config) {}
}

impl<R> CycleRunner for Box<R>
where
    R: CycleRunner + ?Sized,
{
    fn run_cycle(
        &mut self,
        server: Option<&mut ServerConnection>,
        command: &Command,
    ) -> CycleVerdict {
        (**self).run_cycle(server, command)
    }

    fn set_diagnostics(&mut self, enabled: bool) {
        (**self).set_diagnostics(enabled);
    }

    fn reconfigure(&mut self, config: &Config) {
        (**self).reconfigure(config);
    }
}

/// Runner used by the `schedd` binary when no placement engine is linked.
///
/// Logs every command, exits on [`CommandKind::Quit`] and continues
/// otherwise.
#[derive(Debug, Default)]
pub struct LoggingCycleRunner {
    diagnostics: bool,
    cycles: u64,
}

impl LoggingCycleRunner {
    /// Builds a runner with diagnostics off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycles run so far.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl CycleRunner for LoggingCycleRunner {
    fn run_cycle(
        &mut self,
        server: Option<&mut ServerConnection>,
        command: &Command,
    ) -> CycleVerdict {
        self.cycles += 1;
        let origin = server.map(|conn| conn.address().to_string());
        info!(
            target: DISPATCH_TARGET,
            cycle = self.cycles,
            command = %command.kind(),
            job_id = command.job_id().unwrap_or_default(),
            server = origin.as_deref().unwrap_or("internal"),
            diagnostics = self.diagnostics,
            "scheduling cycle"
        );
        if command.kind() == CommandKind::Quit {
            CycleVerdict::Exit
        } else {
            CycleVerdict::Continue
        }
    }

    fn set_diagnostics(&mut self, enabled: bool) {
        self.diagnostics = enabled;
    }
}
