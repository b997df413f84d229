//! Cycle runner double that records every cycle it is asked to run.

use std::sync::{Arc, Mutex};

use schedd_config::Config;

use crate::command::{Command, CommandKind, ConnectionId};
use crate::dispatch::{CycleRunner, CycleVerdict};
use crate::registry::ServerConnection;

/// One cycle as the runner saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    pub kind: CommandKind,
    pub job_id: Option<String>,
    pub server: Option<String>,
    pub connection: Option<ConnectionId>,
}

#[derive(Debug, Default)]
struct RunnerState {
    cycles: Vec<CycleRecord>,
    diagnostics: Vec<bool>,
    reconfigurations: Vec<String>,
    active: bool,
    overlapped: bool,
}

/// Records cycles and exits when told to.
///
/// Clones share their record, so a test can keep one handle while the
/// dispatcher owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingCycleRunner {
    state: Arc<Mutex<RunnerState>>,
    exit_on: Option<CommandKind>,
    exit_after: Option<usize>,
}

impl RecordingCycleRunner {
    /// A runner that always continues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exits on the first command of `kind`.
    #[must_use]
    pub fn exit_on(mut self, kind: CommandKind) -> Self {
        self.exit_on = Some(kind);
        self
    }

    /// Exits on the `count`th cycle.
    #[must_use]
    pub fn exit_after(mut self, count: usize) -> Self {
        self.exit_after = Some(count);
        self
    }

    /// Every cycle run so far.
    #[must_use]
    pub fn cycles(&self) -> Vec<CycleRecord> {
        self.lock().cycles.clone()
    }

    /// Job ids of the cycles run so far, `-` for commands without one.
    #[must_use]
    pub fn job_ids(&self) -> Vec<String> {
        self.cycles()
            .into_iter()
            .map(|cycle| cycle.job_id.unwrap_or_else(|| "-".to_owned()))
            .collect()
    }

    /// Command kinds of the cycles run so far.
    #[must_use]
    pub fn kinds(&self) -> Vec<CommandKind> {
        self.cycles().into_iter().map(|cycle| cycle.kind).collect()
    }

    /// Diagnostics settings pushed to the runner, in order.
    #[must_use]
    pub fn diagnostics_changes(&self) -> Vec<bool> {
        self.lock().diagnostics.clone()
    }

    /// Scheduler names of the configurations pushed to the runner.
    #[must_use]
    pub fn reconfigurations(&self) -> Vec<String> {
        self.lock().reconfigurations.clone()
    }

    /// Whether a cycle ever started while another was running.
    #[must_use]
    pub fn overlapped(&self) -> bool {
        self.lock().overlapped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().expect("runner mutex poisoned")
    }
}

impl CycleRunner for RecordingCycleRunner {
    fn run_cycle(
        &mut self,
        server: Option<&mut ServerConnection>,
        command: &Command,
    ) -> CycleVerdict {
        let count = {
            let mut state = self.lock();
            if state.active {
                state.overlapped = true;
            }
            state.active = true;
            state.cycles.push(CycleRecord {
                kind: command.kind(),
                job_id: command.job_id().map(str::to_owned),
                server: server.as_ref().map(|conn| conn.address().to_string()),
                connection: server.as_ref().map(|conn| conn.id()),
            });
            state.active = false;
            state.cycles.len()
        };
        let exit = self.exit_on == Some(command.kind()) || self.exit_after == Some(count);
        if exit {
            CycleVerdict::Exit
        } else {
            CycleVerdict::Continue
        }
    }

    fn set_diagnostics(&mut self, enabled: bool) {
        self.lock().diagnostics.push(enabled);
    }

    fn reconfigure(&mut self, config: &Config) {
        self.lock()
            .reconfigurations
            .push(config.scheduler_name().to_owned());
    }
}
