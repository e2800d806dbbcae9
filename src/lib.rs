#![doc = include_str!("../README.md")]

mod broker;
mod config;
mod error;
mod http;
mod registry;
mod subscription;

pub use broker::{Broker, SELECTOR_ON_CONNECT, SELECTOR_ON_JOIN, SELECTOR_ON_LEAVE};
pub use config::{
    BrokerConfig, Hooks, NoopHooks, ResolvedSession, SessionResolver, UnauthenticatedResolver,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_PATH, DEFAULT_STREAM_PATH,
    DEFAULT_SUBSCRIPTIONS_PATH, DEFAULT_TIMEOUT,
};
pub use error::BrokerError;
pub use http::create_event_router;
pub use subscription::{Subscription, SubscriptionId, UNKNOWN_CHANNEL};

/// Milliseconds elapsed since this process first asked for the time.
///
/// Shared by [`subscription::Subscription`] (stamping `CreatedAt` /
/// `LastPulseAt`) and [`broker::Broker`] (comparing against `Timeout`).
/// Built on `tokio::time::Instant` rather than `SystemTime` specifically
/// so that expiry tests can use `tokio::time::{pause, advance}` instead of
/// sleeping real wall-clock time; an epoch origin was never part of the
/// external contract (timestamps never cross the wire).
pub(crate) fn now_millis() -> u64 {
    static ORIGIN: std::sync::OnceLock<tokio::time::Instant> = std::sync::OnceLock::new();
    let origin = *ORIGIN.get_or_init(tokio::time::Instant::now);
    tokio::time::Instant::now()
        .saturating_duration_since(origin)
        .as_millis() as u64
}

/// Install a `tracing` subscriber for test output. Ok if successful, Err
/// if already initialized by an earlier test in the same binary.
#[cfg(test)]
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
