//! Process-wide `tracing` subscriber setup.
//!
//! - `FOREMAN_LOG`: `EnvFilter` directives. Falls back to `foreman=info,warn`,
//!   or `foreman=debug,info` when `DEBUG` is set.
//! - `FOREMAN_LOG_FORMAT`: `json` for machine-readable lines, anything else
//!   for the compact human format.

use std::{env, io};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

const fn default_directives(debug: bool) -> &'static str {
    if debug {
        "foreman=debug,info"
    } else {
        "foreman=info,warn"
    }
}

/// Install the global subscriber, writing to stderr. A second call (or a
/// subscriber installed by the host) leaves the existing one in place.
///
/// Returns the format that was requested.
pub fn init_tracing() -> LogFormat {
    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directives(env::var("DEBUG").is_ok())));
    let format = LogFormat::from_env_value(env::var("FOREMAN_LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(io::stderr))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    format
}
