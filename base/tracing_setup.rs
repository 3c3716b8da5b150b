// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Logic for installing a `tracing` subscriber for the crate's own tests and
//! for embedders that don't already have one set up.
//!
//! Unlike the teacher's daemon-oriented `tracing_setup`, there's no systemd
//! journal to format for here: packaging runs as a library call, not a
//! long-lived service, so this is just an env-filter-driven `fmt` subscriber
//! a test or a small demo binary can install once at startup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a process-wide `tracing` subscriber, once.
///
/// Safe to call repeatedly (from every test in a suite, for instance); only
/// the first call takes effect. The filter defaults to `info` and honors
/// `RUST_LOG` if set, matching `tracing_subscriber::EnvFilter`'s usual
/// convention.
pub fn install() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();
        // `set_global_default` fails if a subscriber is already installed;
        // that's fine, it just means someone beat us to it.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install();
        install();
    }
}
