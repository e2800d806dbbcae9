//! Broker configuration and the external extension points (hooks, session
//! resolution) treated as boundary collaborators.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::error::BrokerError;
use crate::subscription::Subscription;

/// Default path for the SSE streaming endpoint.
pub const DEFAULT_STREAM_PATH: &str = "/event-stream";
/// Default path for the heartbeat endpoint.
pub const DEFAULT_HEARTBEAT_PATH: &str = "/event-heartbeat";
/// Default path for the subscribers admin endpoint.
pub const DEFAULT_SUBSCRIPTIONS_PATH: &str = "/event-subscribers";
/// Default subscription idle timeout before opportunistic reaping.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default heartbeat interval advertised to clients in `cmd.onConnect`.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Observer hooks invoked at points in a subscription's lifecycle.
///
/// These are the statically-typed replacement for single-slot functional
/// callbacks (`OnCreated` / `OnSubscribe` / `OnUnsubscribe`): a single
/// `Arc<dyn Hooks>` observer, defaulting to a no-op implementation.
pub trait Hooks: Send + Sync {
    /// Called by the stream handler right after a `Subscription` is built,
    /// before it is registered. May mutate `Meta` (e.g. to add custom
    /// fields looked up from a user profile store).
    fn on_created(&self, _sub: &Subscription) {}

    /// Called by `Broker::register` after the subscription has been
    /// inserted into all five indices, while still holding the
    /// subscription's monitor. Returning an error fails registration; the
    /// indices are not rolled back — a retried `Unsubscribe` or the
    /// opportunistic expiry path will eventually clean up the stale
    /// entries.
    fn on_subscribe(&self, _sub: &Subscription) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Called by `Broker::handle_unregister` after the subscription has
    /// been removed from all five indices, before `Dispose`.
    fn on_unsubscribe(&self, _sub: &Subscription) {}
}

/// No-op [`Hooks`] implementation, used when the embedding application does
/// not need any of the extension points.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// The identity fields an external session/authentication layer resolves
/// for an incoming stream request. Authentication and session lookup are
/// explicitly out of scope for this crate; this trait is the seam a host
/// application fills in.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSession {
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    /// Human-readable user name.
    pub user_name: Option<String>,
    /// Session id, if the transport carries one.
    pub session_id: Option<String>,
    /// Display name to show other subscribers.
    pub display_name: Option<String>,
    /// Profile picture / page URL.
    pub profile_url: Option<String>,
    /// Whether the request carried a valid, authenticated session.
    pub is_authenticated: bool,
}

/// Resolves the caller's session from the incoming request headers.
///
/// The default implementation (`UnauthenticatedResolver`) never
/// authenticates anybody; a host application that has its own session
/// middleware implements this trait to bridge its session type into the
/// broker's identity model.
pub trait SessionResolver: Send + Sync {
    /// Resolve identity information for a new stream request.
    fn resolve(&self, headers: &HeaderMap) -> ResolvedSession;
}

/// A [`SessionResolver`] that treats every request as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnauthenticatedResolver;

impl SessionResolver for UnauthenticatedResolver {
    fn resolve(&self, _headers: &HeaderMap) -> ResolvedSession {
        ResolvedSession::default()
    }
}

/// Broker configuration.
///
/// Every field here is fixed for the lifetime of a `Broker` (paths and
/// timeouts are not expected to change while the process is serving
/// traffic), so a plain `Clone`d struct is sufficient — no need for an
/// `ArcSwap`-backed runtime-mutable inner. See DESIGN.md for the explicit
/// decision not to reach for the `config` crate at this scope.
#[derive(Clone)]
pub struct BrokerConfig {
    /// Endpoint path for the SSE stream.
    pub stream_path: String,
    /// Endpoint path for heartbeat pings.
    pub heartbeat_path: String,
    /// Endpoint path for the admin subscriber listing.
    pub subscriptions_path: String,
    /// Age of `LastPulseAt` beyond which a subscription is reaped on next
    /// publish to it.
    pub timeout: Duration,
    /// Heartbeat interval advertised to clients in `cmd.onConnect`.
    pub heartbeat_interval: Duration,
    /// Whether to broadcast `cmd.onJoin` / `cmd.onLeave` to a
    /// subscription's channel.
    pub notify_channel_of_subscriptions: bool,
    /// Broker-level lifecycle hooks.
    pub hooks: std::sync::Arc<dyn Hooks>,
    /// External session resolver for the stream endpoint.
    pub session_resolver: std::sync::Arc<dyn SessionResolver>,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("stream_path", &self.stream_path)
            .field("heartbeat_path", &self.heartbeat_path)
            .field("subscriptions_path", &self.subscriptions_path)
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field(
                "notify_channel_of_subscriptions",
                &self.notify_channel_of_subscriptions,
            )
            .finish_non_exhaustive()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            heartbeat_path: DEFAULT_HEARTBEAT_PATH.to_string(),
            subscriptions_path: DEFAULT_SUBSCRIPTIONS_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            notify_channel_of_subscriptions: true,
            hooks: std::sync::Arc::new(NoopHooks),
            session_resolver: std::sync::Arc::new(UnauthenticatedResolver),
        }
    }
}

/// Seed metadata carried by every subscription: `userId`, `displayName`,
/// `profileUrl`.
pub(crate) fn seed_meta(user_id: &str, display_name: &str, profile_url: &str) -> HashMap<String, String> {
    let mut meta = HashMap::with_capacity(3);
    meta.insert("userId".to_string(), user_id.to_string());
    meta.insert("displayName".to_string(), display_name.to_string());
    meta.insert("profileUrl".to_string(), profile_url.to_string());
    meta
}
