//! Tracing bootstrap.
//!
//! The library only emits `tracing` events; binaries and tests that want to
//! see them call [`init_tracing`].

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a fmt subscriber with uptime timestamps.
///
/// The filter comes from `RUST_LOG`, defaulting to `async_test_loop=info`.
/// Calling it again (or after another subscriber was installed) is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("async_test_loop=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialised");
    }
}
