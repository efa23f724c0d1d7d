//! `[timestamp] [SEVERITY] message` lines on stderr.
//!
//! Severities are `INFO`, `WARNING`, `ERROR` and `SUCCESS`; the last is an
//! `info` event emitted with `target: "success"` (see [`success!`]).
//! `DEBUG` lines appear with `--verbose`.

use chrono::Local;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const SUCCESS_TARGET: &str = "success";

/// Logs a `SUCCESS` line.
#[macro_export]
macro_rules! success {
    ($($arg:tt)+) => {
        ::tracing::info!(target: $crate::utils::logging::SUCCESS_TARGET, $($arg)+)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Errors only; used by `verify --json` so stdout stays machine-readable.
    Quiet,
    Normal,
    Verbose,
}

pub struct SeverityFormat;

pub fn severity_label(level: &Level, target: &str) -> &'static str {
    if target == SUCCESS_TARGET {
        return "SUCCESS";
    }
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

impl<S, N> FormatEvent<S, N> for SeverityFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "[{}] [{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            severity_label(meta.level(), meta.target())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn default_directives(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Quiet => "error",
        Verbosity::Normal => "info,sqlx=warn,aws=warn",
        Verbosity::Verbose => "debug,sqlx=info,aws=info,hyper=info",
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(verbosity: Verbosity) {
    let default = default_directives(verbosity);
    let filter = match verbosity {
        Verbosity::Quiet => EnvFilter::new(default),
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(SeverityFormat)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_labels() {
        assert_eq!(severity_label(&Level::INFO, "dbvault::backup"), "INFO");
        assert_eq!(severity_label(&Level::WARN, "dbvault::remote"), "WARNING");
        assert_eq!(severity_label(&Level::ERROR, "dbvault"), "ERROR");
        assert_eq!(severity_label(&Level::DEBUG, "dbvault"), "DEBUG");
        assert_eq!(severity_label(&Level::INFO, SUCCESS_TARGET), "SUCCESS");
    }

    #[test]
    fn test_quiet_still_reports_errors() {
        assert_eq!(default_directives(Verbosity::Quiet), "error");
        assert!(default_directives(Verbosity::Normal).starts_with("info"));
        assert!(default_directives(Verbosity::Verbose).starts_with("debug"));
    }
}
