//! Process-wide tracing setup.

use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

/// Installs the global `fmt` subscriber. Must be called once, before the first event.
pub fn configure(filter: EnvFilter) {
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();
}
