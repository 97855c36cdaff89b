//! Shared test doubles for the presspack crates.

pub mod mocks;

/// Initialise tracing for a test binary. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
