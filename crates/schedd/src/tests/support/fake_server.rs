//! In-process batch server speaking the scheduler wire protocol over TCP.
//!
//! An accept thread answers each registration with the configured status and
//! hands accepted sockets to the test in arrival order, so a scheduler
//! connection shows up as its primary socket followed by its secondary one.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::SockRef;

use schedd_config::ServerAddress;

use crate::codec::{
    RegistrationReply, encode_command, read_registration_request, write_registration_reply,
};
use crate::command::CommandRecord;

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    reject_code: AtomicI32,
    registrations: Mutex<Vec<(String, String)>>,
    accepted: AtomicUsize,
    stop: AtomicBool,
}

/// Fake batch server bound to an ephemeral loopback port.
pub struct FakeBatchServer {
    address: ServerAddress,
    shared: Arc<Shared>,
    streams: Receiver<TcpStream>,
    handle: Option<JoinHandle<()>>,
}

impl FakeBatchServer {
    /// Starts a server that accepts every registration.
    pub fn start() -> Self {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind fake batch server");
        listener
            .set_nonblocking(true)
            .expect("nonblocking fake listener");
        let port = listener.local_addr().expect("fake server address").port();
        let shared = Arc::new(Shared {
            reject_code: AtomicI32::new(0),
            registrations: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });
        let (sender, streams) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            while !thread_shared.stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Some(stream) = register(stream, &thread_shared)
                            && sender.send(stream).is_err()
                        {
                            return;
                        }
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(_) => return,
                }
            }
        });
        Self {
            address: ServerAddress::new("127.0.0.1", port),
            shared,
            streams,
            handle: Some(handle),
        }
    }

    /// Starts a server that refuses registrations with `code`.
    pub fn start_rejecting(code: i32) -> Self {
        let server = Self::start();
        server.reject_with(code);
        server
    }

    /// Address schedulers should connect to.
    pub fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    /// Refuses later registrations with `code`; zero accepts again.
    pub fn reject_with(&self, code: i32) {
        self.shared.reject_code.store(code, Ordering::SeqCst);
    }

    /// Registrations seen so far as `(user, scheduler name)`.
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.shared
            .registrations
            .lock()
            .expect("registrations mutex poisoned")
            .clone()
    }

    /// Number of sockets whose registration was accepted.
    pub fn accepted_sockets(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Waits for the next registered scheduler connection.
    pub fn next_session(&self) -> ServerSession {
        let primary = self.next_stream().expect("primary socket should arrive");
        let secondary = self.next_stream().expect("secondary socket should arrive");
        ServerSession { primary, secondary }
    }

    fn next_stream(&self) -> Option<TcpStream> {
        match self.streams.recv_timeout(SESSION_TIMEOUT) {
            Ok(stream) => Some(stream),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Drop for FakeBatchServer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}

fn register(mut stream: TcpStream, shared: &Shared) -> Option<TcpStream> {
    stream.set_nonblocking(false).ok()?;
    let (user, name) = read_registration_request(&mut stream).ok()?;
    shared
        .registrations
        .lock()
        .expect("registrations mutex poisoned")
        .push((user, name));
    let code = shared.reject_code.load(Ordering::SeqCst);
    let reply = if code == 0 {
        RegistrationReply::accepted()
    } else {
        RegistrationReply::rejected(code, format!("scheduler refused with code {code}"))
    };
    write_registration_reply(&mut stream, &reply).ok()?;
    if code != 0 {
        return None;
    }
    shared.accepted.fetch_add(1, Ordering::SeqCst);
    Some(stream)
}

/// Server side of one scheduler connection.
pub struct ServerSession {
    /// Request/reply socket.
    pub primary: TcpStream,
    /// Command push socket.
    pub secondary: TcpStream,
}

impl ServerSession {
    /// Pushes a command record.
    pub fn send(&mut self, record: &CommandRecord) {
        encode_command(&mut self.secondary, record).expect("push command");
    }

    /// Pushes raw bytes, which need not form a whole record.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.secondary.write_all(bytes).expect("push bytes");
        self.secondary.flush().expect("flush bytes");
    }

    /// Pushes a request to consider one job.
    pub fn send_job(&mut self, job_id: &str) {
        self.send(&CommandRecord::for_job(job_id));
    }

    /// Reads one cycle marker, or `None` if none arrives in time.
    pub fn read_marker(&mut self, timeout: Duration) -> Option<i32> {
        self.secondary
            .set_read_timeout(Some(timeout))
            .expect("set marker timeout");
        let mut bytes = [0_u8; 4];
        match self.secondary.read_exact(&mut bytes) {
            Ok(()) => Some(i32::from_be_bytes(bytes)),
            Err(_) => None,
        }
    }

    /// Aborts the command socket so the scheduler sees a reset.
    pub fn reset(self) {
        SockRef::from(&self.secondary)
            .set_linger(Some(Duration::ZERO))
            .expect("set linger");
        drop(self.secondary);
        drop(self.primary);
    }

    /// Closes both sockets cleanly.
    pub fn close(self) {
        drop(self.secondary);
        drop(self.primary);
    }
}
