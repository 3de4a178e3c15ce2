//! The supervision loop between the real TTY and the child's PTY.
//!
//! Bytes typed at the terminal flow to the child (minus any XON/XOFF the
//! terminal uses for flow control); bytes the child writes flow back to
//! the terminal, but only while transmission is enabled. A stretch of
//! terminal silence longer than the activity timeout triggers a liveness
//! probe, and a terminal that fails it gets the child hung up. Window
//! size changes on the real TTY are mirrored onto the child's PTY.
//!
//! Everything runs on one thread: readiness on the two descriptors is
//! multiplexed through poll(2), and the only other suspension point is
//! the blocking wait that reaps the child during teardown.

use crate::flow;
use crate::probe::{self, DeviceState};
use crate::pty::Child;
use crate::term;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, FlushArg, InputFlags, SetArg};
use nix::unistd;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 4096;

/// Set by the SIGWINCH handler, consumed at the edge of each loop
/// iteration. Single writer, single reader; an update observed one
/// iteration late is harmless.
static SIGWINCH_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    SIGWINCH_PENDING.store(true, Ordering::Relaxed);
}

/// Window-change disposition bracket: installs the flag-setting handler
/// and restores whatever disposition was there before on drop.
struct SigwinchGuard {
    previous: SigAction,
}

impl SigwinchGuard {
    fn install() -> nix::Result<Self> {
        // No SA_RESTART: the main poll must come back early so a resize
        // is serviced before the next stretch of idle waiting.
        let action = SigAction::new(
            SigHandler::Handler(handle_sigwinch),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(Signal::SIGWINCH, &action) }?;
        SIGWINCH_PENDING.store(false, Ordering::Relaxed);
        Ok(Self { previous })
    }
}

impl Drop for SigwinchGuard {
    fn drop(&mut self) {
        if unsafe { sigaction(Signal::SIGWINCH, &self.previous) }.is_err() {
            warn!("failed to restore the window-change signal disposition");
        }
    }
}

/// Supervise `command` on a PTY bridged to `tty`.
///
/// `activity_timeout` is the number of seconds of terminal silence
/// tolerated before a liveness probe is sent; a negative value disables
/// hangup detection entirely. `reply_deadline` is the per-probe reply
/// budget in seconds. Returns the child's exit status once the session
/// ends; the terminal attributes and the window-change disposition are
/// restored on every exit path.
pub fn run(
    tty: BorrowedFd<'_>,
    command: &[String],
    activity_timeout: f64,
    reply_deadline: f64,
) -> Result<i32> {
    let _winch =
        SigwinchGuard::install().context("failed to install the window-change handler")?;

    let size = term::window_size(tty.as_raw_fd()).context("failed to read the terminal size")?;
    let raw = term::RawModeGuard::enter(tty, SetArg::TCSAFLUSH)
        .context("failed to put the terminal into raw mode")?;

    let child = Child::spawn(command, raw.saved(), &size)?;
    info!("session started: {}", command.join(" "));

    mediate(tty, &child, activity_timeout, reply_deadline);

    let status = child.reap();
    if let Err(err) = termios::tcflush(&tty, FlushArg::TCIOFLUSH) {
        warn!("failed to flush terminal I/O: {}", err);
    }

    // Guards drop here: attributes first, then the signal disposition.
    status
}

/// Forward bytes between the TTY and the child until either side goes
/// away, probing the terminal whenever it stays silent too long.
fn mediate(tty: BorrowedFd<'_>, child: &Child, activity_timeout: f64, reply_deadline: f64) {
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut tx_enabled = true;
    let mut timeout = activity_timeout;
    let mut budget_ms = (1000.0 * timeout) as i32;

    loop {
        if timeout >= 0.0 {
            // An interruption adjustment may have pushed the budget
            // below zero.
            budget_ms = budget_ms.max(0);
        }
        let wait_started = Instant::now();

        let mut pfds = [
            PollFd::new(tty, PollFlags::POLLIN),
            PollFd::new(child.master(), PollFlags::POLLIN),
        ];
        // The child's side only participates while transmission is
        // enabled; reading it while the terminal holds XOFF would force
        // writes the terminal asked us not to make.
        let nfds = if tx_enabled { 2 } else { 1 };
        let wait_ms = if timeout >= 0.0 { budget_ms } else { -1 };

        let mut interrupted = false;
        match poll(&mut pfds[..nfds], term::poll_timeout(wait_ms)) {
            Ok(0) => {
                // Silence budget exhausted. A terminal that is holding
                // XOFF cannot legally be probed, and one that has held
                // it this long cannot be told apart from a dead line.
                let state = if tx_enabled {
                    let report = probe::probe(tty, reply_deadline);
                    if !report.reply.is_empty()
                        && term::write_all(&child.master(), &report.reply).is_err()
                    {
                        break;
                    }
                    report.state
                } else {
                    DeviceState::Offline
                };

                if state == DeviceState::Offline {
                    info!("terminal is offline, hanging up the child");
                    timeout = -1.0;
                    budget_ms = -1;
                    let _ = child.signal(Signal::SIGHUP);
                } else {
                    budget_ms = (1000.0 * timeout) as i32;
                }
            }
            Ok(_) => {
                let tty_events = pfds[0].revents().unwrap_or(PollFlags::empty());
                if !tty_events.is_empty() {
                    if !term::descriptor_alive(&pfds[0]) {
                        debug!("terminal descriptor is gone");
                        break;
                    }
                    let received = match unistd::read(tty.as_raw_fd(), &mut buffer) {
                        Ok(n) if n > 0 => n,
                        _ => break,
                    };

                    // The session may toggle flow control underneath us
                    // (stty on the child's side propagates out), so the
                    // live flags decide whether DC1/DC3 are data.
                    let mut length = received;
                    if let Ok(attrs) = termios::tcgetattr(&tty) {
                        if attrs.input_flags.contains(InputFlags::IXOFF) {
                            length = flow::filter(&mut buffer[..received], &mut tx_enabled);
                        }
                    }

                    if length > 0 && term::write_all(&child.master(), &buffer[..length]).is_err() {
                        break;
                    }

                    if timeout >= 0.0 {
                        budget_ms = (1000.0 * timeout) as i32;
                    }
                }

                if !term::descriptor_alive(&pfds[1]) {
                    debug!("child closed its terminal");
                    break;
                }
                let child_events = pfds[1].revents().unwrap_or(PollFlags::empty());
                if tx_enabled && !child_events.is_empty() {
                    let received = match unistd::read(child.master_fd(), &mut buffer) {
                        Ok(n) if n > 0 => n,
                        _ => break,
                    };
                    if term::write_all(&tty, &buffer[..received]).is_err() {
                        break;
                    }
                }
            }
            Err(Errno::EINTR) => interrupted = true,
            Err(err) => {
                warn!("wait for terminal activity failed: {}", err);
                break;
            }
        }

        if SIGWINCH_PENDING.swap(false, Ordering::Relaxed) {
            if let Ok(new_size) = term::window_size(tty.as_raw_fd()) {
                if child.resize(&new_size).is_ok() {
                    let _ = child.signal(Signal::SIGWINCH);
                }
            }
        }

        if interrupted && timeout >= 0.0 {
            // Resume the wait with whatever slack the interruption left.
            let elapsed = wait_started.elapsed().as_millis().min(i32::MAX as u128) as i32;
            budget_ms -= elapsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::PollTimeout;
    use nix::pty::openpty;
    use nix::sys::termios::tcgetattr;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::sync::{Mutex, OnceLock};
    use std::thread;
    use std::time::Duration;

    /// The loop installs a process-wide SIGWINCH disposition, so tests
    /// that enter it cannot overlap.
    static SESSION_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        SESSION_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    fn command(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn read_until(master: &mut std::fs::File, needle: &[u8]) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        while !collected
            .windows(needle.len())
            .any(|window| window == needle)
        {
            let n = master.read(&mut buf).expect("terminal side read failed");
            assert!(n > 0, "terminal side saw EOF before {:?}", needle);
            collected.extend_from_slice(&buf[..n]);
        }
        collected
    }

    #[test]
    fn test_child_exit_code_is_reported() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();

        let code = run(pty.slave.as_fd(), &command(&["sh", "-c", "exit 5"]), -1.0, 0.2).unwrap();
        assert_eq!(code, 5);
    }

    #[test]
    fn test_child_signal_death_is_reported() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();

        let code = run(
            pty.slave.as_fd(),
            &command(&["sh", "-c", "kill -TERM $$"]),
            -1.0,
            0.2,
        )
        .unwrap();
        assert_eq!(code, 128 + 15);
    }

    #[test]
    fn test_terminal_input_round_trips_through_the_child() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();
        let mut master = std::fs::File::from(pty.master);

        let driver = thread::spawn(move || {
            // Give the session a moment to finish entering raw mode;
            // the switch flushes pending terminal input.
            thread::sleep(Duration::from_millis(200));
            master.write_all(b"ping\n").unwrap();
            let seen = read_until(&mut master, b"ping");
            drop(master);
            seen
        });

        let code = run(pty.slave.as_fd(), &command(&["cat"]), -1.0, 0.2).unwrap();
        assert_eq!(code, 0);
        driver.join().unwrap();
    }

    #[test]
    fn test_attributes_restored_after_session() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();

        let before = tcgetattr(&pty.slave).unwrap().local_flags;
        run(pty.slave.as_fd(), &command(&["true"]), -1.0, 0.2).unwrap();
        let after = tcgetattr(&pty.slave).unwrap().local_flags;

        assert_eq!(before, after);
    }

    #[test]
    fn test_silent_terminal_gets_the_child_hung_up() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();
        let mut master = std::fs::File::from(pty.master);

        // sh dies on the SIGHUP; the probe request is all the faux
        // terminal ever sees.
        let driver = thread::spawn(move || read_until(&mut master, b"\x1b[6n"));

        let started = Instant::now();
        let code = run(
            pty.slave.as_fd(),
            &command(&["sh", "-c", "sleep 30"]),
            1.0,
            0.1,
        )
        .unwrap();

        assert_eq!(code, 128 + 1);
        assert!(started.elapsed() < Duration::from_secs(10));
        driver.join().unwrap();
    }

    #[test]
    fn test_xoff_gates_child_output_until_xon() {
        let _guard = lock();
        let pty = openpty(None, None).unwrap();

        // Software flow control must be active on the terminal for
        // DC1/DC3 to be interpreted at all.
        let mut attrs = tcgetattr(&pty.slave).unwrap();
        attrs.input_flags.insert(InputFlags::IXOFF);
        termios::tcsetattr(&pty.slave, SetArg::TCSANOW, &attrs).unwrap();

        let master_fd = pty.master.as_raw_fd();
        let mut master = std::fs::File::from(pty.master);

        let driver = thread::spawn(move || {
            // Give the session a moment to finish entering raw mode;
            // the switch flushes pending terminal input.
            thread::sleep(Duration::from_millis(200));

            // Pause transmission, then ask the child for output.
            master.write_all(b"\x13hello\n").unwrap();

            // Nothing may come back while XOFF is in force.
            thread::sleep(Duration::from_millis(300));
            let borrowed = unsafe { BorrowedFd::borrow_raw(master_fd) };
            let mut pfd = [PollFd::new(borrowed, PollFlags::POLLIN)];
            let pending = poll(&mut pfd, PollTimeout::from(100u16)).unwrap();
            assert_eq!(pending, 0, "child output leaked through an XOFF window");

            // Resume; the backlog must now drain.
            master.write_all(b"\x11").unwrap();
            let seen = read_until(&mut master, b"hello");
            assert!(
                !seen.contains(&0x13) && !seen.contains(&0x11),
                "flow-control bytes reached the child"
            );
            drop(master);
        });

        let code = run(pty.slave.as_fd(), &command(&["cat"]), -1.0, 0.2).unwrap();
        assert_eq!(code, 0);
        driver.join().unwrap();
    }

    #[test]
    fn test_window_change_reaches_the_child() {
        let _guard = lock();
        let size = nix::pty::Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(&size, None).unwrap();
        let slave_fd = pty.slave.as_raw_fd();
        let mut master = std::fs::File::from(pty.master);

        // The child announces the window change it receives, then exits
        // (the signal aborts the read).
        let script = "trap 'printf WINCHED:; stty size' WINCH; stty size; read -r _; :";

        // The faux outer terminal has no foreground process group, so
        // the resize notification is raised by hand, aimed at the
        // supervising thread so its wait is the one interrupted.
        let supervising = nix::sys::pthread::pthread_self();

        let driver = thread::spawn(move || {
            read_until(&mut master, b"24 80");

            let resized = nix::pty::Winsize {
                ws_row: 40,
                ws_col: 100,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            term::set_window_size(slave_fd, &resized).unwrap();
            nix::sys::pthread::pthread_kill(supervising, Signal::SIGWINCH).unwrap();

            read_until(&mut master, b"WINCHED:");
            read_until(&mut master, b"40 100");
            drop(master);
        });

        let code = run(pty.slave.as_fd(), &command(&["sh", "-c", script]), -1.0, 0.2).unwrap();
        assert_eq!(code, 0);
        driver.join().unwrap();
    }
}
