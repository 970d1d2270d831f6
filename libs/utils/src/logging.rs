//! Tracing setup for the command-line binary.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Initialize the tracing subscriber. Events written through the `log`
/// macros (the Postgres format crates use those) are bridged in by the
/// `tracing-log` feature of the fmt layer.
///
/// `default_level` is used unless `RUST_LOG` overrides it.
pub fn init(default_level: LevelFilter) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
