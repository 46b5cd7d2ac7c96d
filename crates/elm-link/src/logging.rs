//! Logging setup

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Does nothing if a subscriber is
/// already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
        tracing::info!("logging initialised");
    }
}
