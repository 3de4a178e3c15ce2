//! PTY (pseudo-terminal) management for the supervised command.
//!
//! Provides a handle for:
//! - Allocating a PTY pair and spawning the user command on the follower side
//! - Resizing the child's terminal and signalling the child
//! - Reaping the child and folding its fate into an exit status
//!
//! The child's terminal is seeded with the attributes and window size the
//! outer TTY had before supervision began, so the command observes the
//! cooked terminal the user configured rather than the raw one the
//! supervisor runs against.

use crate::NAME;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execvp, fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::process;
use tracing::debug;

/// The command exists but could not be executed.
pub const EXIT_EXECUTION_FAILED: i32 = 126;

/// The command could not be found.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Offset added to the signal number when the child was killed by one.
const EXIT_TERMSIG_OFFSET: i32 = 128;

/// A spawned command and the controller side of its PTY.
pub struct Child {
    master: OwnedFd,
    pid: Pid,
}

impl Child {
    /// Allocate a PTY initialized from `attrs` and `size`, fork, and exec
    /// `command` with the follower as its controlling terminal.
    ///
    /// When the exec fails the forked child reports the cause on standard
    /// error and exits 127 (not found) or 126 (anything else); those codes
    /// surface later through [`Child::reap`].
    pub fn spawn(command: &[String], attrs: &Termios, size: &Winsize) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("command cannot be empty");
        }

        // Prepared before forking so a bad argv fails in the parent.
        let program = CString::new(command[0].as_str())
            .with_context(|| format!("{}: invalid command name", command[0]))?;
        let argv: Vec<CString> = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<_, _>>()
            .context("command arguments must not contain NUL bytes")?;

        let OpenptyResult { master, slave } =
            openpty(size, attrs).context("failed to open a PTY")?;

        match unsafe { fork() }.context("failed to fork")? {
            ForkResult::Parent { child } => {
                drop(slave);
                debug!("spawned {} with pid {}", command[0], child);
                Ok(Self { master, pid: child })
            }
            ForkResult::Child => {
                drop(master);

                // New session with the follower as controlling terminal.
                let _ = nix::unistd::setsid();
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                let slave_raw = slave.as_raw_fd();
                let _ = dup2(slave_raw, libc::STDIN_FILENO);
                let _ = dup2(slave_raw, libc::STDOUT_FILENO);
                let _ = dup2(slave_raw, libc::STDERR_FILENO);
                if slave_raw > 2 {
                    drop(slave);
                }

                let err = match execvp(&program, &argv) {
                    Ok(_) => unreachable!("execvp returned without an error"),
                    Err(err) => err,
                };
                eprintln!("{}: {}: {}", NAME, command[0], err.desc());
                process::exit(if err == Errno::ENOENT {
                    EXIT_COMMAND_NOT_FOUND
                } else {
                    EXIT_EXECUTION_FAILED
                });
            }
        }
    }

    /// The controller descriptor, for polling and forwarding.
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Apply new window dimensions to the child's terminal.
    pub fn resize(&self, size: &Winsize) -> nix::Result<()> {
        crate::term::set_window_size(self.master.as_raw_fd(), size)
    }

    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        signal::kill(self.pid, sig)
    }

    /// Close the controller descriptor and block until the child is
    /// reaped, folding its fate into an exit status: the exit code
    /// verbatim, or 128 plus the signal number for a signal death.
    pub fn reap(self) -> Result<i32> {
        drop(self.master);

        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(EXIT_TERMSIG_OFFSET + sig as i32),
            Ok(status) => anyhow::bail!("unexpected wait status: {:?}", status),
            Err(err) => Err(err).context("failed to reap the child"),
        }
    }
}
