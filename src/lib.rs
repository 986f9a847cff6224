//! Local-first time-travel snapshot engine: content-addressed storage,
//! incremental snapshots of a working tree, and rollback planning with
//! conflict classification and three-way merge.

pub mod config;
pub mod content_store;
pub mod diff;
pub mod engine;
pub mod errors;
pub mod hash;
pub mod metadata_store;
pub mod model;
pub mod repository;
pub mod retention;
pub mod rollback;
pub mod scanner;
pub mod utils;

pub use errors::{Result, RewindError};
pub use repository::Repository;

/// Installs a `tracing-subscriber` `fmt` layer filtered by `RUST_LOG`
/// (default `warn`) for this crate's own test suite. Idempotent: later
/// calls in the same process are no-ops since a global subscriber can
/// only be set once. Embedding applications are expected to install
/// their own subscriber; the crate itself never calls this outside
/// `cfg(test)`.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
