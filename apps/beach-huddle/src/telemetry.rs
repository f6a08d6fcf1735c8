//! Process-wide tracing setup for the `beach-huddle` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Replaces the computed filter directives entirely.
pub const FILTER_ENV: &str = "HUDDLE_LOG_FILTER";
/// Lifts the cap on webrtc dependency targets.
pub const TRACE_DEPS_ENV: &str = "HUDDLE_TRACE_DEPS";

/// The webrtc stack logs every ICE check and DTLS record at debug and below.
const WEBRTC_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Filter directives for this config, with override variables read
    /// through `env`. The flag is set when webrtc targets were capped.
    pub fn directives(&self, env: impl Fn(&str) -> Option<String>) -> (String, bool) {
        if let Some(custom) = env(FILTER_ENV).filter(|value| !value.trim().is_empty()) {
            return (custom, false);
        }
        let own = match self.level {
            LogLevel::Trace => "info,huddle=trace,beach_huddle=trace,doc_store=trace",
            LogLevel::Debug => "info,huddle=debug,beach_huddle=debug,doc_store=debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        let deps_allowed =
            env(TRACE_DEPS_ENV).is_some_and(|value| !value.is_empty() && value != "0");
        if self.level < LogLevel::Info || deps_allowed {
            return (own.to_owned(), false);
        }
        let capped = WEBRTC_TARGETS
            .iter()
            .fold(own.to_owned(), |mut directives, target| {
                directives.push(',');
                directives.push_str(target);
                directives.push_str("=warn");
                directives
            });
        (capped, true)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install log subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Flushes buffered log lines when the process exits.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let (directives, capped) = config.directives(|name| std::env::var(name).ok());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish()
        .try_init()?;

    let _ = GUARD.set(guard);
    if capped {
        tracing::debug!(
            target = "huddle::telemetry",
            "webrtc logs capped at warn; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
        );
    }
    Ok(())
}
