//! Readiness multiplexer over the secondary sockets.
//!
//! A thin owner of an epoll instance. The wait atomically installs the
//! caller's signal mask for its duration, so signals kept blocked on the main
//! thread are delivered only while it is parked here and show up as
//! [`MultiplexError::Interrupted`].

use std::collections::BTreeSet;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::SigSet;
use thiserror::Error;

/// Conditions a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// Data is available to read.
    pub const READABLE: Self = Self(libc::EPOLLIN.cast_unsigned());
    /// The peer closed its end.
    pub const HANGUP: Self = Self((libc::EPOLLHUP | libc::EPOLLRDHUP).cast_unsigned());
    /// The descriptor is in an error state.
    pub const ERROR: Self = Self(libc::EPOLLERR.cast_unsigned());
    /// Everything a command channel cares about.
    pub const COMMANDS: Self = Self::READABLE.union(Self::HANGUP).union(Self::ERROR);

    /// Combines two interest sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    const fn bits(self) -> u32 {
        self.0
    }
}

/// One descriptor reported by [`Multiplexer::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    fd: RawFd,
    events: u32,
}

impl Readiness {
    /// Descriptor that became ready.
    #[must_use]
    pub const fn fd(self) -> RawFd {
        self.fd
    }

    /// Whether the descriptor has data to read.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.events & Interest::READABLE.bits() != 0
    }

    /// Whether the peer hung up.
    #[must_use]
    pub const fn is_hangup(self) -> bool {
        self.events & Interest::HANGUP.bits() != 0
    }

    /// Whether the descriptor reported an error.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.events & Interest::ERROR.bits() != 0
    }
}

/// Errors raised by the multiplexer.
#[derive(Debug, Error)]
pub enum MultiplexError {
    /// Creating the epoll instance failed.
    #[error("failed to create multiplexer: {source}")]
    Create {
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// Adding a descriptor failed.
    #[error("failed to watch descriptor {fd}: {source}")]
    Register {
        /// Descriptor being added.
        fd: RawFd,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// Removing a descriptor failed.
    #[error("failed to unwatch descriptor {fd}: {source}")]
    Deregister {
        /// Descriptor being removed.
        fd: RawFd,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// A signal arrived while waiting.
    #[error("wait interrupted by a signal")]
    Interrupted,
    /// Waiting failed for another reason.
    #[error("multiplexer wait failed: {source}")]
    Wait {
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

impl MultiplexError {
    /// Whether the wait was cut short by a signal.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Owner of an epoll instance and the set of descriptors it watches.
pub struct Multiplexer {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
    watched: BTreeSet<RawFd>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Multiplexer")
            .field("epoll", &self.epoll)
            .field("capacity", &self.events.len())
            .field("watched", &self.watched)
            .finish()
    }
}

impl Multiplexer {
    /// Creates a multiplexer reporting at most `capacity` descriptors per wait.
    pub fn create(capacity: usize) -> Result<Self, MultiplexError> {
        // SAFETY: epoll_create1 has no memory preconditions.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(MultiplexError::Create {
                source: Errno::last(),
            });
        }
        // SAFETY: `raw` is a fresh descriptor nothing else owns.
        let epoll = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            epoll,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            watched: BTreeSet::new(),
        })
    }

    /// Starts watching `fd`.
    pub fn add(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> Result<(), MultiplexError> {
        let raw = fd.as_raw_fd();
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: u64::from(raw.cast_unsigned()),
        };
        // SAFETY: `event` is a valid epoll_event for the duration of the call.
        let result = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                raw,
                &raw mut event,
            )
        };
        if result < 0 {
            return Err(MultiplexError::Register {
                fd: raw,
                source: Errno::last(),
            });
        }
        self.watched.insert(raw);
        Ok(())
    }

    /// Stops watching `fd`. Unknown descriptors are ignored.
    pub fn remove(&mut self, fd: BorrowedFd<'_>) -> Result<(), MultiplexError> {
        let raw = fd.as_raw_fd();
        if !self.watched.remove(&raw) {
            return Ok(());
        }
        // SAFETY: EPOLL_CTL_DEL ignores the event pointer.
        let result = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                raw,
                ptr::null_mut(),
            )
        };
        if result < 0 {
            let source = Errno::last();
            if source != Errno::ENOENT {
                return Err(MultiplexError::Deregister { fd: raw, source });
            }
        }
        Ok(())
    }

    /// Whether `fd` is currently watched.
    #[must_use]
    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.watched.contains(&fd)
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Whether nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Waits until a watched descriptor is ready.
    ///
    /// `None` waits without limit. `mask` replaces the thread's signal mask
    /// for the duration of the wait. A timeout yields an empty list.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        mask: &SigSet,
    ) -> Result<Vec<Readiness>, MultiplexError> {
        let timeout_ms = timeout.map_or(-1, |limit| {
            libc::c_int::try_from(limit.as_millis()).unwrap_or(libc::c_int::MAX)
        });
        let max_events = libc::c_int::try_from(self.events.len()).unwrap_or(libc::c_int::MAX);
        let sigmask: &libc::sigset_t = mask.as_ref();
        // SAFETY: the event buffer holds `max_events` entries and outlives the
        // call; the mask reference is valid for the call.
        let count = unsafe {
            libc::epoll_pwait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                max_events,
                timeout_ms,
                ptr::from_ref(sigmask),
            )
        };
        let ready = match usize::try_from(count) {
            Ok(ready) => ready,
            Err(_) => {
                return match Errno::last() {
                    Errno::EINTR => Err(MultiplexError::Interrupted),
                    source => Err(MultiplexError::Wait { source }),
                };
            }
        };
        Ok(self
            .events
            .iter()
            .take(ready)
            .filter_map(|event| {
                let data = event.u64;
                let bits = event.events;
                u32::try_from(data).ok().map(|fd| Readiness {
                    fd: fd.cast_signed(),
                    events: bits,
                })
            })
            .collect())
    }

    /// Closes the epoll instance.
    pub fn destroy(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use nix::sys::signal::{self, SigmaskHow, Signal};

    use super::*;

    const SHORT: Option<Duration> = Some(Duration::from_millis(200));

    #[test]
    fn reports_readable_descriptor() {
        let mut mux = Multiplexer::create(4).expect("create");
        let (mut writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::COMMANDS).expect("add");
        writer.write_all(&[0, 0, 0, 1]).expect("write");

        let ready = mux.wait(SHORT, &SigSet::empty()).expect("wait");
        assert_eq!(ready.len(), 1);
        let first = ready.first().copied().expect("ready entry");
        assert_eq!(first.fd(), reader.as_raw_fd());
        assert!(first.is_readable());
    }

    #[test]
    fn timeout_yields_empty_list() {
        let mut mux = Multiplexer::create(4).expect("create");
        let (_writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::COMMANDS).expect("add");
        let ready = mux
            .wait(Some(Duration::from_millis(20)), &SigSet::empty())
            .expect("wait");
        assert!(ready.is_empty());
    }

    #[test]
    fn removed_descriptor_is_not_reported() {
        let mut mux = Multiplexer::create(4).expect("create");
        let (mut writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::COMMANDS).expect("add");
        mux.remove(reader.as_fd()).expect("remove");
        mux.remove(reader.as_fd()).expect("second remove is a no-op");
        assert!(mux.is_empty());
        writer.write_all(&[1]).expect("write");
        let ready = mux
            .wait(Some(Duration::from_millis(20)), &SigSet::empty())
            .expect("wait");
        assert!(ready.is_empty());
    }

    #[test]
    fn reports_hangup_when_peer_closes() {
        let mut mux = Multiplexer::create(4).expect("create");
        let (writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::COMMANDS).expect("add");
        drop(writer);
        let ready = mux.wait(SHORT, &SigSet::empty()).expect("wait");
        let first = ready.first().copied().expect("ready entry");
        assert!(first.is_hangup());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut mux = Multiplexer::create(1).expect("create");
        let (_writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::READABLE).expect("add");
        let error = mux
            .add(reader.as_fd(), Interest::READABLE)
            .expect_err("second add should fail");
        assert!(matches!(
            error,
            MultiplexError::Register {
                source: Errno::EEXIST,
                ..
            }
        ));
    }

    #[test]
    fn pending_signal_interrupts_wait() {
        let delivered = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(libc::SIGUSR2, Arc::clone(&delivered)).expect("register");
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGUSR2);
        let mut previous = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
            .expect("block");
        signal::raise(Signal::SIGUSR2).expect("raise");

        let mut mux = Multiplexer::create(1).expect("create");
        let (_writer, reader) = UnixStream::pair().expect("pair");
        mux.add(reader.as_fd(), Interest::COMMANDS).expect("add");
        let result = mux.wait(None, &SigSet::empty());

        signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)
            .expect("restore mask");
        assert!(matches!(result, Err(MultiplexError::Interrupted)));
        assert!(delivered.load(Ordering::SeqCst));
    }
}
