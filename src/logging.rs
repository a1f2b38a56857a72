//! Subscriber setup for binaries and examples embedding the library.
//!
//! Honours `RUST_LOG`; defaults to `info`. Remote worker output is logged on
//! the `flock::remote` target, so `RUST_LOG=info,flock::remote=off` silences
//! it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber. Panics if one is already set.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a subscriber
/// is already installed.
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
