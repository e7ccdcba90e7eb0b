use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbosity` picks the level for this
/// workspace's crates and everything else stays at `warn`.
pub fn init(verbosity: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("Failed to initialise logging: {err}"))
}

fn default_directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,weather={level},weather_core={level}")
}
