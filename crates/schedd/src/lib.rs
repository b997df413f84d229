//! Command channel and cycle dispatch for a batch scheduler daemon.
//!
//! The daemon keeps two registered TCP sockets open to every configured batch
//! server. Servers push scheduling commands down the secondary socket; the
//! daemon multiplexes those sockets with `epoll`, queues what arrives, and
//! runs exactly one scheduling cycle at a time through a [`CycleRunner`]. When
//! a cycle finishes, a completion marker goes back on the socket the command
//! came from so the server may push the next one.
//!
//! ## Lifecycle
//!
//! [`run_scheduler`] loads configuration through `ortho_config`, initialises
//! structured telemetry, takes the singleton lock in the runtime directory and
//! then connects every server. A refused registration is fatal. Once all
//! servers are up the main loop serves until a cycle asks to exit or the
//! operator sends `SIGINT`/`SIGTERM`; `SIGHUP` reloads the configuration
//! between cycles and `SIGUSR1` toggles diagnostic recording.
//!
//! Broken connections are rebuilt against the same address under a fresh
//! [`command::ConnectionId`], so commands still queued from the old
//! connection are discarded rather than acknowledged on the wrong socket.

mod bootstrap;
pub mod codec;
pub mod command;
mod controller;
pub mod dispatch;
mod health;
pub mod multiplexer;
mod process;
pub mod queue;
pub mod registry;
pub mod signals;
mod telemetry;

pub use bootstrap::{
    BootstrapError, Bootstrapped, ConfigLoader, StaticConfigLoader, SystemConfigLoader,
    bootstrap_with, build_allow_list,
};
pub use controller::{Controller, ControllerError, ControllerSettings, ExitReason};
pub use dispatch::{CycleRunner, CycleVerdict, LoggingCycleRunner};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use process::{CRASH_WINDOW, CrashGuardError, LaunchError, run_scheduler, should_restart};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
