mod respond;
mod selftest;
mod version;

pub use selftest::SelftestReport;

use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use picomsg_frame::{MAX_SIZE_BITS, MIN_SIZE_BITS};

use crate::exit::CliResult;
use crate::logging::LogLevel;
use crate::output::OutputFormat;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the greeting-and-echo round trip between a parent and a child.
    Selftest(SelftestArgs),
    /// Exec'd child side of `selftest --mode exec`.
    #[command(hide = true)]
    Respond(RespondArgs),
    /// Show version information.
    Version(VersionArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum SelftestMode {
    /// Both ends in this process over a socket pair.
    Pair,
    /// Child process from `fork`.
    Fork,
    /// Child process that re-runs this binary after `fork`.
    Exec,
    /// Child thread over shared rings.
    Thread,
}

impl SelftestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SelftestMode::Pair => "pair",
            SelftestMode::Fork => "fork",
            SelftestMode::Exec => "exec",
            SelftestMode::Thread => "thread",
        }
    }
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    /// Where the child end lives.
    #[arg(long, value_enum, default_value = "pair")]
    pub mode: SelftestMode,

    /// Seed for the payload generator.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Payload size in units of `--pudge` bytes.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=4096))]
    pub stack: u32,

    /// Largest chunk sent as one message.
    #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(1..=1_048_576))]
    pub pudge: u32,

    /// Ring size class: each ring holds 2^BITS bytes.
    #[arg(long, value_name = "BITS", value_parser = clap::value_parser!(u32).range(MIN_SIZE_BITS as i64..=MAX_SIZE_BITS as i64))]
    pub ring_bits: Option<u32>,

    /// Wait for each reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Lifecycle diagnostics mask (0-15).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=15))]
    pub noise: u8,
}

#[derive(Args, Debug)]
pub struct RespondArgs {
    /// Wait for each message before giving up.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Lifecycle diagnostics mask (0-15).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=15))]
    pub noise: u8,

    /// Ring size class, matching the parent's.
    #[arg(long, value_name = "BITS")]
    pub ring_bits: Option<u32>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build details.
    #[arg(long)]
    pub extended: bool,
}

pub fn run(command: Command, format: OutputFormat, log_level: LogLevel) -> CliResult<i32> {
    match command {
        Command::Selftest(args) => selftest::run(args, format, log_level),
        Command::Respond(args) => respond::run(args),
        Command::Version(args) => version::run(args),
    }
}

pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (value, unit) = if let Some(ms) = trimmed.strip_suffix("ms") {
        (ms, "ms")
    } else if let Some(s) = trimmed.strip_suffix('s') {
        (s, "s")
    } else {
        (trimmed, "s")
    };

    let amount: u64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {input}"))?;
    if amount == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(amount),
        _ => Duration::from_secs(amount),
    })
}
