//! hupmon: terminal hangup detector and software flow-control mediator.
//!
//! Legacy serial and network-attached terminals can disappear without the
//! kernel ever noticing, leaving shells running against a dead line.
//! hupmon sits between the controlling TTY and a command of your choice,
//! periodically verifies the terminal is still there by querying its
//! cursor position, and delivers SIGHUP to the command when it is not.
//! It also absorbs XON/XOFF flow-control characters so the command never
//! mistakes them for input.
//!
//! Usage:
//!   hupmon [-1fh] [-r seconds] [-t seconds] command...

mod flow;
mod probe;
mod pty;
mod supervisor;
mod term;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use nix::libc;
use nix::unistd::ttyname;
use probe::DeviceState;
use std::env;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::process;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Name of the program, prepended to error messages and warnings.
pub const NAME: &str = "hupmon";

/// Exit status for invalid command line usage.
const EXIT_BAD_USAGE: i32 = 2;

/// Terminal hangup detector and software flow-control mediator
#[derive(Parser, Debug)]
#[command(name = NAME)]
#[command(about = "Terminal hangup detector and software flow-control mediator")]
#[command(version, disable_help_flag = true)]
struct Args {
    /// Query the terminal once, print its status, and exit
    #[arg(short = '1', overrides_with_all = ["one_shot", "flow_only", "hangup"])]
    one_shot: bool,

    /// Mediate software flow control only; never probe for hangups
    #[arg(short = 'f', overrides_with_all = ["one_shot", "flow_only", "hangup"])]
    flow_only: bool,

    /// Detect terminal hangups (default)
    #[arg(short = 'h', overrides_with_all = ["one_shot", "flow_only", "hangup"])]
    hangup: bool,

    /// Seconds to wait for a probe reply (minimum 0.01)
    #[arg(
        short = 'r',
        value_name = "SECONDS",
        default_value_t = 0.2,
        value_parser = parse_reply_deadline
    )]
    reply_deadline: f64,

    /// Seconds of terminal inactivity tolerated before probing (minimum 1)
    #[arg(
        short = 't',
        value_name = "SECONDS",
        default_value_t = 10.0,
        value_parser = parse_activity_timeout
    )]
    activity_timeout: f64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_reply_deadline(text: &str) -> Result<f64, String> {
    let value: f64 = text
        .parse()
        .map_err(|_| format!("{}: invalid value", text))?;
    if value >= 0.01 {
        Ok(value)
    } else {
        Err(format!(
            "{}: the minimum reply timeout must be greater than or equal to 10 ms (0.01)",
            text
        ))
    }
}

fn parse_activity_timeout(text: &str) -> Result<f64, String> {
    let value: f64 = text
        .parse()
        .map_err(|_| format!("{}: invalid value", text))?;
    if value >= 1.0 {
        Ok(value)
    } else {
        Err(format!(
            "{}: the activity timeout must be greater than or equal to 1 second",
            text
        ))
    }
}

/// Command line problems beyond what argument parsing can catch.
#[derive(Debug, Error)]
enum UsageError {
    #[error("input and output must be attached to a TTY")]
    NotATty,
    #[error("input and output must be attached to the same TTY")]
    SplitTty,
    #[error("no command specified")]
    MissingCommand,
    #[error("input is not a TTY")]
    InputNotATty,
    #[error("unexpected non-option arguments")]
    UnexpectedArguments,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("{} v{}", NAME, env!("CARGO_PKG_VERSION"));

    let status = match run(&args) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("{}: {:#}", NAME, err);
            if err.is::<UsageError>() {
                EXIT_BAD_USAGE
            } else {
                1
            }
        }
    };

    process::exit(normalize_status(status));
}

fn run(args: &Args) -> Result<i32> {
    let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };

    if args.one_shot {
        if !term::is_tty(libc::STDIN_FILENO) {
            return Err(UsageError::InputNotATty.into());
        }
        if !args.command.is_empty() {
            return Err(UsageError::UnexpectedArguments.into());
        }
        return report_tty_status(stdin, args.reply_deadline);
    }

    if !term::is_tty(libc::STDIN_FILENO) || !term::is_tty(libc::STDOUT_FILENO) {
        return Err(UsageError::NotATty.into());
    }
    if !term::same_device(libc::STDIN_FILENO, libc::STDOUT_FILENO).unwrap_or(false) {
        return Err(UsageError::SplitTty.into());
    }
    if args.command.is_empty() {
        return Err(UsageError::MissingCommand.into());
    }

    advertise_environment(stdin).context("unable to set environment variables")?;

    let activity_timeout = if args.flow_only {
        -1.0
    } else {
        args.activity_timeout
    };

    supervisor::run(stdin, &args.command, activity_timeout, args.reply_deadline)
}

/// Expose the supervisor to the command: its PID, and the path of the
/// terminal being watched.
fn advertise_environment(tty: BorrowedFd<'_>) -> Result<()> {
    env::set_var("HUPMON_PID", process::id().to_string());

    let tty_path = ttyname(tty).context("cannot resolve the path of the controlling TTY")?;
    env::set_var("HUPMON_TTY", tty_path.as_os_str());

    Ok(())
}

/// Probe the terminal once and print the verdict.
fn report_tty_status(tty: BorrowedFd<'_>, reply_deadline: f64) -> Result<i32> {
    let report = probe::probe(tty, reply_deadline);

    let message = match report.state {
        DeviceState::Unknown => {
            match report.error {
                Some(err) => eprintln!("{}: unable to query the terminal: {}", NAME, err.desc()),
                None => eprintln!("{}: unable to query the terminal", NAME),
            }
            "DEVICE_STATUS_UNKNOWN"
        }
        DeviceState::Offline => "DEVICE_OFFLINE",
        DeviceState::Online => "DEVICE_ONLINE",
    };

    let mut stdout = io::stdout();
    writeln!(stdout, "{}", message)
        .and_then(|()| stdout.flush())
        .context("write error")?;

    Ok(0)
}

/// Clamp a session outcome into the range the shell can represent;
/// anything else collapses to a generic failure.
fn normalize_status(status: i32) -> i32 {
    if (0..=255).contains(&status) {
        status
    } else {
        1
    }
}
