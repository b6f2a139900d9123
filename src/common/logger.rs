//! Logger initialization.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes the global tracing subscriber, writing to stderr. HTTP
/// internals are kept at warn to avoid drowning the request log.
pub fn init_logger(level: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::DEBUG);

    let filter = Targets::new()
        .with_target("hyper", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
        .with_default(level);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr);

    let registered = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();

    if let Err(err) = registered {
        // A second initialization only happens in tests.
        tracing::debug!("logger already initialized: {err}");
    }
}
