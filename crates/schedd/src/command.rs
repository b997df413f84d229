//! Scheduling commands and their origins.

use std::fmt;

/// Kind of scheduling command pushed by a batch server.
///
/// The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Nothing to do; the cycle ends immediately.
    Null = 0,
    /// A new job was queued or became eligible.
    New = 1,
    /// A running job terminated.
    Term = 2,
    /// The scheduling interval elapsed.
    Time = 3,
    /// Reserved recycle request.
    Recycle = 4,
    /// An operator asked for a scheduling iteration.
    Cmd = 5,
    /// Re-read the scheduler configuration.
    Configure = 7,
    /// Exit after this command.
    Quit = 8,
    /// Reload the scheduling ruleset.
    Ruleset = 9,
    /// First cycle after the server (re)started.
    First = 10,
    /// A reservation needs to be confirmed.
    JobReservation = 11,
    /// Consider one specific job; carries a job id.
    Ajob = 12,
    /// A queue was started.
    StartQueue = 13,
    /// A job was moved into a local queue.
    MoveLocal = 14,
    /// Eligible time accrual was switched on.
    EligibleTimeOn = 15,
    /// A degraded reservation needs reconfirming.
    ReservationReconfirm = 16,
    /// The server asks for the current cycle to be restarted.
    RestartCycle = 17,
}

impl CommandKind {
    /// Wire code of this command.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a wire code back to its command, if known.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        let kind = match code {
            0 => Self::Null,
            1 => Self::New,
            2 => Self::Term,
            3 => Self::Time,
            4 => Self::Recycle,
            5 => Self::Cmd,
            7 => Self::Configure,
            8 => Self::Quit,
            9 => Self::Ruleset,
            10 => Self::First,
            11 => Self::JobReservation,
            12 => Self::Ajob,
            13 => Self::StartQueue,
            14 => Self::MoveLocal,
            15 => Self::EligibleTimeOn,
            16 => Self::ReservationReconfirm,
            17 => Self::RestartCycle,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether records of this kind carry a job id.
    #[must_use]
    pub const fn carries_job_id(self) -> bool {
        matches!(self, Self::Ajob)
    }

    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::New => "new",
            Self::Term => "term",
            Self::Time => "time",
            Self::Recycle => "recycle",
            Self::Cmd => "cmd",
            Self::Configure => "configure",
            Self::Quit => "quit",
            Self::Ruleset => "ruleset",
            Self::First => "first",
            Self::JobReservation => "job_reservation",
            Self::Ajob => "ajob",
            Self::StartQueue => "start_queue",
            Self::MoveLocal => "move_local",
            Self::EligibleTimeOn => "eligible_time_on",
            Self::ReservationReconfirm => "reservation_reconfirm",
            Self::RestartCycle => "restart_cycle",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Handle naming one incarnation of a server connection.
///
/// Every successful connect mints a fresh id, so commands read from a
/// connection that has since been closed or reconnected no longer resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value, for logs.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "conn-{}", self.0)
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Read off the secondary socket of a server connection.
    Server(ConnectionId),
    /// Synthesised by the daemon itself, e.g. after `SIGHUP`.
    Internal,
}

/// A decoded command record, before it is attributed to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Command kind.
    pub kind: CommandKind,
    /// Job id; present only for [`CommandKind::Ajob`].
    pub job_id: Option<String>,
}

impl CommandRecord {
    /// Record without a job id.
    #[must_use]
    pub const fn new(kind: CommandKind) -> Self {
        Self { kind, job_id: None }
    }

    /// Record asking for one job to be considered.
    #[must_use]
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Ajob,
            job_id: Some(job_id.into()),
        }
    }
}

/// A queued scheduling command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    job_id: Option<String>,
    origin: Origin,
}

impl Command {
    /// Attributes a decoded record to its connection.
    #[must_use]
    pub fn from_record(record: CommandRecord, origin: Origin) -> Self {
        Self {
            kind: record.kind,
            job_id: record.job_id,
            origin,
        }
    }

    /// Builds a daemon-generated command.
    #[must_use]
    pub const fn internal(kind: CommandKind) -> Self {
        Self {
            kind,
            job_id: None,
            origin: Origin::Internal,
        }
    }

    /// Command kind.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Job id for [`CommandKind::Ajob`] commands.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Connection the command arrived on.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }
}
