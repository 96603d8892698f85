mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "picomsg", version, about = "Parent/child message passing CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format, cli.log_level);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::SelftestMode;

    #[test]
    fn parses_selftest_subcommand() {
        let cli = Cli::try_parse_from([
            "picomsg",
            "selftest",
            "--mode",
            "thread",
            "--seed",
            "7",
            "--timeout",
            "2s",
        ])
        .expect("selftest args should parse");

        match cli.command {
            Command::Selftest(args) => {
                assert!(matches!(args.mode, SelftestMode::Thread));
                assert_eq!(args.seed, 7);
                assert_eq!(args.timeout, std::time::Duration::from_secs(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Cli::try_parse_from(["picomsg", "selftest", "--timeout", "0"])
            .expect_err("zero timeout should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn rejects_ring_bits_out_of_range() {
        let err = Cli::try_parse_from(["picomsg", "selftest", "--ring-bits", "40"])
            .expect_err("ring bits should be bounded");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn respond_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["picomsg", "respond", "--timeout", "500ms"])
            .expect("respond args should parse");
        assert!(matches!(cli.command, Command::Respond(_)));
    }
}
