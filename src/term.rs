//! Terminal state management for the outer (real) TTY.
//!
//! Provides:
//! - A raw-mode bracket that restores the saved attributes on every exit path
//! - Window-size ioctls (nix has no TIOCGWINSZ/TIOCSWINSZ wrappers)
//! - Descriptor identity checks used to validate stdin/stdout before a session
//! - Small poll(2) helpers shared by the prober and the supervision loop

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::write;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use tracing::warn;

/// Raw-mode bracket over a TTY descriptor.
///
/// Entering captures the current attributes and applies a `cfmakeraw`
/// equivalent with a flush. The saved attributes are restored when the
/// guard is dropped, so every exit path (including panics) leaves the
/// terminal the way the user had it.
pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Termios,
    restore_with: SetArg,
}

impl<'fd> RawModeGuard<'fd> {
    /// Switch `fd` into raw mode, flushing pending I/O first.
    ///
    /// `restore_with` selects the queue discipline used when the guard
    /// restores the saved attributes (the supervision loop flushes, the
    /// prober drains so a late reply is not discarded mid-flight).
    pub fn enter(fd: BorrowedFd<'fd>, restore_with: SetArg) -> nix::Result<Self> {
        let saved = termios::tcgetattr(&fd)?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&fd, SetArg::TCSAFLUSH, &raw)?;

        Ok(Self {
            fd,
            saved,
            restore_with,
        })
    }

    /// The attributes captured before raw mode was applied.
    pub fn saved(&self) -> &Termios {
        &self.saved
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if termios::tcsetattr(&self.fd, self.restore_with, &self.saved).is_err() {
            warn!("failed to restore terminal attributes");
        }
    }
}

/// Whether `fd` refers to a terminal device.
pub fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) != 0 }
}

/// Whether two descriptors refer to the same underlying file.
///
/// Identity is established by comparing device and inode numbers.
pub fn same_device(fd1: RawFd, fd2: RawFd) -> nix::Result<bool> {
    let mut stat1: libc::stat = unsafe { std::mem::zeroed() };
    let mut stat2: libc::stat = unsafe { std::mem::zeroed() };

    let rc = unsafe { libc::fstat(fd1, &mut stat1) };
    if rc == -1 {
        return Err(Errno::last());
    }
    let rc = unsafe { libc::fstat(fd2, &mut stat2) };
    if rc == -1 {
        return Err(Errno::last());
    }

    Ok(stat1.st_dev == stat2.st_dev && stat1.st_ino == stat2.st_ino)
}

/// Read the current window dimensions of a terminal.
pub fn window_size(fd: RawFd) -> nix::Result<Winsize> {
    let mut size: Winsize = unsafe { std::mem::zeroed() };

    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as libc::c_ulong, &mut size) };
    if rc == -1 {
        return Err(Errno::last());
    }

    Ok(size)
}

/// Apply window dimensions to a terminal (typically a PTY controller).
pub fn set_window_size(fd: RawFd, size: &Winsize) -> nix::Result<()> {
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as libc::c_ulong, size) };
    if rc == -1 {
        return Err(Errno::last());
    }

    Ok(())
}

/// Convert a millisecond budget into a poll(2) timeout.
///
/// Negative values mean wait forever.
pub(crate) fn poll_timeout(ms: i32) -> PollTimeout {
    if ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
    }
}

/// Whether a polled descriptor is still usable after the wait.
pub(crate) fn descriptor_alive(pfd: &PollFd) -> bool {
    let bad = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
    !pfd.revents().unwrap_or(PollFlags::empty()).intersects(bad)
}

/// Write the whole of `data`, retrying interrupted and would-block writes.
pub(crate) fn write_all<F: AsFd>(fd: &F, data: &[u8]) -> nix::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match write(fd, &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
