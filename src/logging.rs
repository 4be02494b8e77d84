//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, SkeinError};

/// Installs a global `tracing` subscriber filtered by `filter` (an
/// `EnvFilter` directive string such as `"skein=debug"`).
///
/// Intended for binaries and test harnesses; library code only emits events.
pub fn init_tracing(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| SkeinError::InvalidArgument(format!("bad filter directive: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| SkeinError::InvalidArgument("tracing already initialized".into()))
}
