//! Logging setup for the benchmark binary.
//!
//! Installs a `tracing-subscriber` fmt layer that honours `RUST_LOG`
//! (defaulting to `info`) and stamps events with local RFC 3339 time. The
//! `chanpool` library is built with its `tracing` feature, so dial progress
//! and close failures show up here too.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;
    Ok(())
}
