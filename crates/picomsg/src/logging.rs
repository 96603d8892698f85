use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Crates whose events follow `--log-level`. Everything else is held at warn.
const OWN_TARGETS: [&str; 4] = ["picomsg", "picomsg_comms", "picomsg_frame", "picomsg_transport"];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// Spelling accepted by `--log-level`, for re-invoking ourselves.
    pub fn as_arg(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn targets(level: LogLevel) -> Targets {
    let level = level.as_filter();
    OWN_TARGETS
        .iter()
        .fold(Targets::new(), |targets, target| targets.with_target(*target, level))
        .with_default(level.min(LevelFilter::WARN))
}

/// Install the stderr subscriber. A responder child calls this too, so its
/// lines carry the process's thread names.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true);

    let registry = tracing_subscriber::registry();
    let _ = match format {
        LogFormat::Text => registry.with(layer.with_filter(targets(level))).try_init(),
        LogFormat::Json => registry.with(layer.json().with_filter(targets(level))).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn own_crates_follow_the_chosen_level() {
        let filter = targets(LogLevel::Debug);
        assert!(filter.would_enable("picomsg_comms::connection", &Level::DEBUG));
        assert!(filter.would_enable("picomsg::cmd::selftest", &Level::DEBUG));
        assert!(!filter.would_enable("picomsg_frame::ring", &Level::TRACE));
    }

    #[test]
    fn other_crates_stay_at_warn() {
        let filter = targets(LogLevel::Trace);
        assert!(!filter.would_enable("mio::poll", &Level::INFO));
        assert!(filter.would_enable("mio::poll", &Level::WARN));
    }

    #[test]
    fn quiet_levels_apply_everywhere() {
        let filter = targets(LogLevel::Error);
        assert!(!filter.would_enable("picomsg_transport::stream", &Level::WARN));
        assert!(!filter.would_enable("mio::poll", &Level::WARN));
        assert!(filter.would_enable("mio::poll", &Level::ERROR));
    }
}
