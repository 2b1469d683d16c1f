//! Utilities for logging.
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

/// How verbose logging should be when `RUST_LOG` isn't set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Info,
    Debug,
    Trace,
}

impl From<u8> for Verbosity {
    fn from(value: u8) -> Self {
        match value {
            0 => Verbosity::Info,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl From<Verbosity> for Level {
    fn from(value: Verbosity) -> Self {
        match value {
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Human readable, one line per event.
    #[default]
    Compact,
    /// Newline delimited json.
    Json,
}

/// Initialize a global subscriber.
///
/// `RUST_LOG` takes precedence over the provided verbosity. Calling this
/// more than once is a no-op.
pub fn init(verbosity: impl Into<Verbosity>, mode: LoggingMode) {
    let level: Level = verbosity.into().into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let _ = match mode {
        LoggingMode::Compact => builder.compact().try_init(),
        LoggingMode::Json => builder.json().try_init(),
    };
}

/// Initialize a subscriber for tests.
///
/// Output is captured by the test harness and only shown for failing tests.
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
