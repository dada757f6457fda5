//! Background daemonization with a synchronous startup handshake.
//!
//! Calling `daemon(3)` is not an option here: detaching before the storage
//! layer comes up loses every startup error, and detaching after upsets the
//! transport. Instead the process forks around an unnamed pipe and the
//! parent stays attached to the terminal until the child reports a single
//! 4-byte startup result. The child-death signal is blocked before the fork
//! and given a no-op handler in the parent, so a child that dies without
//! reporting interrupts the parent's wait instead of deadlocking it.
//!
//! The write side is single-use: [`StartupReporter::report`] consumes the
//! descriptor on first use, so a second call is a guaranteed no-op.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::exit;

use log::{debug, info};
use nix::errno::Errno;
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{self, fork, ForkResult};

use super::config::MountConfig;
use super::constants::EXIT_PROTOCOL_FAILURE;
use super::error::StartError;

/// Which process the caller continues as after [`daemonize`].
pub enum Fork {
    /// No fork was performed; the caller stays attached to the terminal.
    Foreground(StartupReporter),
    /// The caller is the background child of a completed fork.
    BackgroundChild(StartupReporter),
}

impl Fork {
    /// The startup reporter for whichever process continues.
    pub fn into_reporter(self) -> StartupReporter {
        match self {
            Fork::Foreground(reporter) | Fork::BackgroundChild(reporter) => reporter,
        }
    }
}

/// Result of the parent's blocking wait on the handshake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The child wrote a 4-byte startup result.
    Reported(i32),
    /// The wait was interrupted because the child died without reporting.
    ChildDied,
    /// Fewer than four bytes arrived on the channel.
    Malformed,
}

impl HandshakeOutcome {
    /// Exit status the waiting parent should terminate with.
    ///
    /// A zero report exits 0; a nonzero report is passed through, clamped
    /// into valid exit-status range; anything else is a protocol failure.
    pub fn exit_code(self) -> i32 {
        match self {
            HandshakeOutcome::Reported(0) => 0,
            HandshakeOutcome::Reported(code) => code.clamp(1, 255),
            HandshakeOutcome::ChildDied | HandshakeOutcome::Malformed => EXIT_PROTOCOL_FAILURE,
        }
    }
}

/// Write side of the handshake, owned by the process that continues.
pub struct StartupReporter {
    fd: Option<OwnedFd>,
}

impl StartupReporter {
    /// A reporter whose reports are no-ops, for foreground runs.
    pub fn disabled() -> Self {
        Self { fd: None }
    }

    /// Reports the startup result to the waiting parent, exactly once.
    ///
    /// On a zero (success) report the calling process also detaches: it
    /// changes directory to the root and redirects its standard streams to
    /// the null device. A nonzero report leaves the streams alone so the
    /// failure stays visible. Subsequent calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Protocol`] on a short write or when detaching
    /// fails.
    pub fn report(&mut self, code: i32) -> Result<(), StartError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };

        info!("Reporting startup result {} to parent", code);
        let bytes = code.to_ne_bytes();
        let written = unistd::write(fd.as_raw_fd(), &bytes)
            .map_err(|err| StartError::Protocol(format!("handshake write failed: {err}")))?;
        drop(fd);
        if written != bytes.len() {
            return Err(StartError::Protocol("short handshake write".to_string()));
        }

        if code == 0 {
            detach()?;
        }
        Ok(())
    }
}

/// Read side of the handshake, held by the waiting parent.
pub struct StartupWaiter {
    fd: OwnedFd,
}

impl StartupWaiter {
    /// Blocks until the child reports, dies, or breaks the protocol.
    ///
    /// The wait is a `pselect` with an empty signal mask, so the blocked
    /// child-death signal is delivered only for the duration of the wait
    /// and shows up as an interrupted call.
    pub fn wait(self) -> HandshakeOutcome {
        let mut read_set = FdSet::new();
        read_set.insert(self.fd.as_raw_fd());

        match pselect(None, &mut read_set, None, None, None, &SigSet::empty()) {
            Err(Errno::EINTR) => return HandshakeOutcome::ChildDied,
            Err(_) => return HandshakeOutcome::Malformed,
            Ok(_) => {}
        }

        let mut buf = [0u8; 4];
        match unistd::read(self.fd.as_raw_fd(), &mut buf) {
            Ok(n) if n == buf.len() => HandshakeOutcome::Reported(i32::from_ne_bytes(buf)),
            Ok(_) | Err(_) => HandshakeOutcome::Malformed,
        }
    }
}

/// Creates a connected reporter/waiter pair over an unnamed pipe.
pub fn handshake_channel() -> Result<(StartupReporter, StartupWaiter), StartError> {
    let (read_fd, write_fd) = unistd::pipe()
        .map_err(|err| StartError::Protocol(format!("failed to create handshake pipe: {err}")))?;
    let reporter = StartupReporter {
        fd: Some(unsafe { OwnedFd::from_raw_fd(write_fd) }),
    };
    let waiter = StartupWaiter {
        fd: unsafe { OwnedFd::from_raw_fd(read_fd) },
    };
    Ok((reporter, waiter))
}

/// Optionally moves the process into the background.
///
/// In foreground mode no fork happens and the returned reporter is
/// disabled. Otherwise the process forks: the child returns with the write
/// side of the handshake and proceeds with startup, while the parent blocks
/// on the read side and exits with a status derived from whatever arrives
/// there. The parent never returns from this function.
pub fn daemonize(config: &MountConfig) -> Result<Fork, StartError> {
    if config.foreground {
        return Ok(Fork::Foreground(StartupReporter::disabled()));
    }

    let (reporter, waiter) = handshake_channel()?;

    // Block the child-death signal before forking so it cannot be delivered
    // between the fork and the parent's handler installation.
    let mut sigchld = SigSet::empty();
    sigchld.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigchld), None)
        .map_err(|err| StartError::Protocol(format!("failed to block SIGCHLD: {err}")))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(waiter);
            debug!("Continuing startup in background child");
            Ok(Fork::BackgroundChild(reporter))
        }
        Ok(ForkResult::Parent { child }) => {
            drop(reporter);
            debug!("Waiting for startup report from child {}", child);

            // The handler only needs to exist so the blocking wait returns
            // with EINTR instead of hanging when the child dies.
            let noop = SigAction::new(SigHandler::Handler(noop_handler), SaFlags::empty(), SigSet::empty());
            unsafe { sigaction(Signal::SIGCHLD, &noop) }
                .map_err(|err| StartError::Protocol(format!("failed to install SIGCHLD handler: {err}")))?;

            let outcome = waiter.wait();
            match outcome {
                HandshakeOutcome::Reported(0) => {}
                HandshakeOutcome::Reported(code) => {
                    eprintln!("Startup failed in background process, exiting {}", code);
                }
                HandshakeOutcome::ChildDied => {
                    eprintln!("Child process died without reporting failure");
                }
                HandshakeOutcome::Malformed => {
                    eprintln!("Malformed startup report from child");
                }
            }
            exit(outcome.exit_code());
        }
        Err(err) => Err(StartError::Protocol(format!("fork failed: {err}"))),
    }
}

extern "C" fn noop_handler(_: libc::c_int) {}

/// Detaches a successfully started daemon from its invoking terminal.
fn detach() -> Result<(), StartError> {
    unistd::chdir("/")
        .map_err(|err| StartError::Protocol(format!("failed to chdir to /: {err}")))?;

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|err| StartError::Protocol(format!("failed to open /dev/null: {err}")))?;
    let null_fd = null.as_raw_fd();
    for fd in 0..3 {
        unistd::dup2(null_fd, fd)
            .map_err(|err| StartError::Protocol(format!("failed to redirect fd {fd}: {err}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reported_result_round_trips() {
        let (mut reporter, waiter) = handshake_channel().unwrap();
        let writer = thread::spawn(move || reporter.report(17).unwrap());
        assert_eq!(waiter.wait(), HandshakeOutcome::Reported(17));
        writer.join().unwrap();
    }

    #[test]
    fn test_second_report_is_a_noop() {
        let (mut reporter, waiter) = handshake_channel().unwrap();
        reporter.report(5).unwrap();
        // The descriptor was consumed by the first call.
        reporter.report(9).unwrap();
        assert_eq!(waiter.wait(), HandshakeOutcome::Reported(5));
    }

    #[test]
    fn test_disabled_reporter_never_fails() {
        let mut reporter = StartupReporter::disabled();
        reporter.report(1).unwrap();
        reporter.report(0).unwrap();
    }

    #[test]
    fn test_dropped_reporter_is_a_protocol_failure() {
        let (reporter, waiter) = handshake_channel().unwrap();
        drop(reporter);
        let outcome = waiter.wait();
        assert_eq!(outcome, HandshakeOutcome::Malformed);
        assert_eq!(outcome.exit_code(), EXIT_PROTOCOL_FAILURE);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(HandshakeOutcome::Reported(0).exit_code(), 0);
        assert_eq!(HandshakeOutcome::Reported(40).exit_code(), 40);
        assert_eq!(HandshakeOutcome::Reported(7000).exit_code(), 255);
        assert_eq!(HandshakeOutcome::ChildDied.exit_code(), EXIT_PROTOCOL_FAILURE);
        assert_eq!(HandshakeOutcome::Malformed.exit_code(), EXIT_PROTOCOL_FAILURE);
    }
}
