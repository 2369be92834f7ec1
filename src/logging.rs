use std::io;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Log directives for a `-v` count; `RUST_LOG` takes precedence when set
pub fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,rusqlite=warn",
        1 => "debug,rusqlite=warn",
        _ => "trace",
    }
}

pub fn configure_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    // Stderr keeps stdout free for reports
    let stderr_log = fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbosity > 1)
        .with_filter(filter);

    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::Registry::default()
        .with(stderr_log)
        .try_init();
}
