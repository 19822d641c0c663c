//! Logging setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the embedding process. `init` is a convenience for binaries.

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, BridgeResult, ValidationError};

/// Install a formatted stdout subscriber.
///
/// `level` is an `EnvFilter` directive such as `info` or
/// `querybridge=debug,warn`. `RUST_LOG`, when set, takes precedence.
pub fn init(level: &str) -> BridgeResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid log level '{level}': {e}"),
        })?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| BridgeError::internal(format!("failed to install subscriber: {e}")))?;

    info!("Logging initialized");
    Ok(())
}

/// Route log output through the test harness; safe to call from every test.
#[cfg(test)]
pub fn init_for_tests() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env().add_directive("querybridge=debug".parse().unwrap());

        // A subscriber may already be installed by another harness.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported() {
        init_for_tests();
        let err = init("info").unwrap_err();
        assert!(err.is_internal());
    }
}
