//! Coordinator half of the isolated execution channel.
//!
//! One channel = one worker process plus its loopback connection. The
//! coordinator is the only reader; after the job message the worker is the
//! only writer. Teardown is idempotent and always reaps the child.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::protocol::{ProtocolError, WireMessage, read_frame, write_frame};

/// How long a spawned worker gets to connect back before the attempt is
/// counted as failed.
pub const ACCEPT_TIMEOUT_MS: u64 = 5_000;

/// Channel-level failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// IO failure on the stream or listener.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The per-evaluation deadline passed while waiting for an event.
    #[error("deadline exceeded waiting for worker event")]
    DeadlineExceeded,
    /// No worker could be started within the bounded retry budget.
    #[error("failed to start a worker after {attempts} attempts: {last}")]
    SpawnFailed {
        /// Attempts made.
        attempts: u32,
        /// Last failure observed.
        last: String,
    },
}

impl ChannelError {
    /// True when the error means the environment cannot start workers at
    /// all, as opposed to one evaluation going wrong.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::SpawnFailed { .. })
    }
}

/// An open channel to one worker process.
#[derive(Debug)]
pub struct WorkerChannel {
    child: Child,
    stream: TcpStream,
    exit: Option<ExitStatus>,
}

impl WorkerChannel {
    /// Spawn a worker and wait for it to connect, retrying up to
    /// `attempts` times.
    pub fn open(worker_exe: &Path, bundle: &Path, attempts: u32) -> Result<Self, ChannelError> {
        let mut last = String::from("no attempt made");
        for _ in 0..attempts.max(1) {
            match Self::open_once(worker_exe, bundle) {
                Ok(channel) => return Ok(channel),
                Err(err) => last = err.to_string(),
            }
        }
        Err(ChannelError::SpawnFailed {
            attempts: attempts.max(1),
            last,
        })
    }

    fn open_once(worker_exe: &Path, bundle: &Path) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let mut child = Command::new(worker_exe)
            .arg("--port")
            .arg(port.to_string())
            .arg("--bundle")
            .arg(bundle)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + Duration::from_millis(ACCEPT_TIMEOUT_MS);
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(ChannelError::Io(std::io::Error::other(format!(
                            "worker exited before connecting: {status}"
                        ))));
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ChannelError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "worker never connected",
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ChannelError::Io(err));
                }
            }
        };
        stream.set_nonblocking(false)?;

        Ok(Self {
            child,
            stream,
            exit: None,
        })
    }

    /// Send one message to the worker.
    pub fn send(&mut self, message: &WireMessage) -> Result<(), ChannelError> {
        write_frame(&mut self.stream, message)?;
        Ok(())
    }

    /// Receive the next event, waiting no longer than `deadline`.
    ///
    /// `Ok(None)` means the worker closed the stream cleanly.
    pub fn recv_by(&mut self, deadline: Instant) -> Result<Option<WireMessage>, ChannelError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(ChannelError::DeadlineExceeded);
        }
        self.stream.set_read_timeout(Some(deadline - now))?;
        match read_frame(&mut self.stream) {
            Ok(message) => Ok(message),
            Err(ProtocolError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Err(ChannelError::DeadlineExceeded)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Forcibly terminate the worker and reap it. Idempotent; any
    /// buffered events are discarded with the stream.
    pub fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.exit = Some(status),
            _ => {
                let _ = self.child.kill();
                if let Ok(status) = self.child.wait() {
                    self.exit = Some(status);
                }
            }
        }
    }

    /// Exit code of the reaped worker, when it exited by itself with one.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.terminate();
        self.exit.and_then(|status| status.code())
    }

    /// True once the worker process has been reaped.
    pub fn is_terminated(&self) -> bool {
        self.exit.is_some()
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}
