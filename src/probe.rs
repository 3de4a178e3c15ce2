//! Active liveness probing of a terminal.
//!
//! A disconnected serial or network terminal often produces no hangup at
//! all; the line just goes quiet. The prober tells the difference between
//! a quiet terminal and a dead one by writing an ANSI Cursor Position
//! Report request and watching for the reply: any response at all means a
//! device is listening, a well-formed `ESC [ row ; col R` is consumed
//! silently, and silence past the deadline means the device is gone.

use crate::flow::XOFF;
use crate::term;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::termios::{self, InputFlags, SetArg};
use nix::unistd;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// ANSI X3.64 control sequence requesting a Cursor Position Report.
const CPR_REQUEST: &[u8] = b"\x1b[6n";

/// Escape character, the first byte of a well-formed reply.
const ESC: u8 = 0x1b;

/// Longest well-formed reply: `ESC [ RRR ; CCC R` for displays up to
/// 999 lines by 999 columns.
const REPLY_MAX: usize = 10;

/// Extra time owed to a terminal that answers with XOFF: it asked us to
/// pause, so the reply deadline moves out accordingly.
const XOFF_GRACE: Duration = Duration::from_millis(100);

/// What the probe concluded about the device behind the TTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// A transport error kept the probe from finishing.
    Unknown,
    /// No reply arrived before the deadline.
    Offline,
    /// At least one byte arrived, even if the reply was malformed.
    Online,
}

/// Outcome of a single probe cycle.
pub struct ProbeReport {
    pub state: DeviceState,
    /// Bytes of a malformed reply. These were consumed from the input
    /// stream while validating, so the caller owes them to the child as
    /// if they had been typed. Empty for a well-formed reply.
    pub reply: Vec<u8>,
    /// Underlying cause when `state` is [`DeviceState::Unknown`].
    pub error: Option<Errno>,
}

/// How the reply validator reacted to one byte.
#[derive(Debug, PartialEq, Eq)]
enum Feed {
    /// The byte fits; keep going.
    Advance,
    /// The byte completed a well-formed reply.
    Complete,
    /// The byte does not belong to a reply.
    Reject,
}

/// Byte-by-byte validator for `ESC '[' D{1,3} ';' D{1,3} 'R'`.
///
/// Steps 0 and 1 expect the introducer, 2-4 the row digits, 5 the
/// separator, 6-8 the column digits, and 9 the terminator. Coordinates
/// shorter than three digits are handled by jumping ahead when the
/// separator or terminator arrives early.
struct CprValidator {
    step: u8,
}

impl CprValidator {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn feed(&mut self, byte: u8) -> Feed {
        if (byte == b';' && (self.step == 3 || self.step == 4))
            || (byte == b'R' && (self.step == 7 || self.step == 8))
        {
            self.step += self.step % 2 + 1;
        }

        let valid = match self.step {
            0 => byte == ESC,
            1 => byte == b'[',
            2..=4 | 6..=8 => byte.is_ascii_digit(),
            5 => byte == b';',
            9 => byte == b'R',
            _ => false,
        };

        if !valid {
            Feed::Reject
        } else if self.step == 9 {
            Feed::Complete
        } else {
            self.step += 1;
            Feed::Advance
        }
    }
}

/// ASCII control characters, including DEL and the C1 range.
fn is_control(byte: u8) -> bool {
    byte == 0x7f || byte <= 0x1f || (0x80..=0x9f).contains(&byte)
}

/// Ask the terminal where its cursor is and wait for the answer.
///
/// The TTY is held in raw mode for the duration of the exchange and its
/// attributes are restored (with drain semantics, so a straggling reply
/// is not thrown away) before this returns. `reply_deadline` is the
/// reply budget in seconds; it should be at least 0.01. A terminal that
/// reports being offline when it is not may simply be slow, in which
/// case the deadline needs raising.
pub fn probe(tty: BorrowedFd<'_>, reply_deadline: f64) -> ProbeReport {
    let mut report = ProbeReport {
        state: DeviceState::Unknown,
        reply: Vec::with_capacity(REPLY_MAX),
        error: None,
    };

    let guard = match term::RawModeGuard::enter(tty, SetArg::TCSADRAIN) {
        Ok(guard) => guard,
        Err(err) => {
            report.error = Some(err);
            return report;
        }
    };

    // Flow control is judged against the attributes the session runs
    // with, not the transient raw set.
    let ixoff = guard.saved().input_flags.contains(InputFlags::IXOFF);

    if let Err(err) = term::write_all(&tty, CPR_REQUEST).and_then(|()| termios::tcdrain(&tty)) {
        report.error = Some(err);
        return report;
    }

    report.state = DeviceState::Offline;
    let mut deadline = Instant::now() + Duration::from_secs_f64(reply_deadline);
    let mut validator = CprValidator::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let budget_ms = remaining.as_millis().min(i32::MAX as u128) as i32;

        let mut pfd = [PollFd::new(tty, PollFlags::POLLIN)];
        match poll(&mut pfd, term::poll_timeout(budget_ms)) {
            Ok(0) => break,
            Ok(_) if !term::descriptor_alive(&pfd[0]) => break,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                report.state = DeviceState::Unknown;
                report.error = Some(err);
                break;
            }
        }

        let mut byte = [0u8; 1];
        match unistd::read(tty.as_raw_fd(), &mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                report.state = DeviceState::Unknown;
                report.error = Some(err);
                break;
            }
        }
        let byte = byte[0];

        report.state = DeviceState::Online;
        trace!("probe received {:#04x}", byte);

        if byte != ESC && is_control(byte) {
            if byte == XOFF && ixoff {
                deadline += XOFF_GRACE;
            }
            continue;
        }

        match validator.feed(byte) {
            Feed::Advance => report.reply.push(byte),
            Feed::Complete => {
                report.reply.clear();
                break;
            }
            Feed::Reject => {
                // The rejecting byte was consumed from the stream, so it
                // must stay forwardable along with the prefix.
                report.reply.push(byte);
                break;
            }
        }
    }

    drop(guard);
    debug!("probe finished: {:?}", report.state);
    report
}
