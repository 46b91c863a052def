//! Logging setup for oomward.
//!
//! All diagnostics go to stderr in a compact single-line format. The daemon
//! locks its memory after startup, so there is deliberately no file appender
//! and no buffering layer.
//!
//! # Environment Variables
//!
//! - `OOMWARD_LOG` - Log filter, overrides the level chosen on the command
//!   line (same syntax as `RUST_LOG`)

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `level` is the base log level (`-d` raises it to DEBUG). The `OOMWARD_LOG`
/// environment variable takes precedence when set. Subsequent calls are
/// silently ignored.
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_env("OOMWARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    // Silently ignore if already initialized (idempotent)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}
