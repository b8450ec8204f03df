//! Application harness shared by the three binaries: common CLI flags,
//! logging setup, and the stats client. Mirrors the source's `App`/`QApp`
//! base classes, minus the argparse-specific bits clap already covers.

pub mod stats;

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Args;
use log::LevelFilter;

/// Routes published messages to a queue of the same name as the routing
/// key, on the default (nameless) exchange.
pub const DEFAULT_EXCHANGE: &str = "";
pub const DEFAULT_ROUTING_KEY: &str = "default";

/// Flags common to every pipeline stage binary. Embed with `#[command(flatten)]`.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// set default logging level to 'debug'
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// set default logging level to 'warn'
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// set default logging level
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// set a specific module's log level, e.g. -L gazette::fetcher=debug
    #[arg(short = 'L', long = "logger-level")]
    pub logger_level: Vec<String>,

    /// RabbitMQ connection URL
    #[arg(short = 'U', long, env = "RABBITMQ_URL", default_value = "amqp://127.0.0.1:5672/%2f")]
    pub rabbitmq_url: String,

    /// consume from the quarantine queue instead of the normal input queue
    #[arg(long)]
    pub from_quarantine: bool,
}

impl CommonArgs {
    /// Installs `env_logger` with the base level resolved from `--debug` /
    /// `--quiet` / `--log-level` (in that priority order) plus any
    /// `module=level` overrides from `--logger-level`.
    pub fn init_logging(&self) {
        let base = if self.debug {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Warn
        } else {
            self.log_level.parse().unwrap_or(LevelFilter::Info)
        };

        let mut builder = env_logger::Builder::new();
        builder.filter_level(base);
        for entry in &self.logger_level {
            let Some((module, level)) = entry.split_once('=') else {
                log::warn!("ignoring malformed --logger-level {entry:?}, want MODULE=LEVEL");
                continue;
            };
            match level.parse() {
                Ok(level) => {
                    builder.filter_module(module, level);
                }
                Err(_) => log::warn!("ignoring unknown level {level:?} for module {module}"),
            }
        }
        let _ = builder.try_init();
    }
}

/// Current time as RFC 3339 / ISO 8601 with second precision and a literal
/// `Z` offset, used for diagnostic headers.
pub fn now_iso8601() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    humantime_iso8601(now.as_secs())
}

/// Seconds since the epoch as a float, matching Python's `time.time()`.
pub fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Formats a unix timestamp as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn humantime_iso8601(secs: u64) -> String {
    let dt = match time::OffsetDateTime::from_unix_timestamp(secs as i64) {
        Ok(dt) => dt,
        Err(_) => return "1970-01-01T00:00:00Z".to_string(),
    };
    let date = dt.date();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        date.year(),
        date.month() as u8,
        date.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_known_instant() {
        // 2021-01-01T00:00:00Z
        assert_eq!(humantime_iso8601(1609459200), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn iso8601_midyear() {
        // 2023-07-04T12:30:00Z
        assert_eq!(humantime_iso8601(1688473800), "2023-07-04T12:30:00Z");
    }
}
