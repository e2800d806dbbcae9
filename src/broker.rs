//! The event broker: ties the [`crate::registry::Registry`] to the hooks
//! and configuration in [`crate::config`], and exposes the publish/notify
//! surface used by both the HTTP handlers and embedding applications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::registry::Registry;
use crate::subscription::Subscription;

/// Selector sent when a subscription first connects.
pub const SELECTOR_ON_CONNECT: &str = "cmd.onConnect";
/// Selector broadcast to a channel when a subscriber joins it.
pub const SELECTOR_ON_JOIN: &str = "cmd.onJoin";
/// Selector broadcast to a channel when a subscriber leaves it.
pub const SELECTOR_ON_LEAVE: &str = "cmd.onLeave";

static ANON_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a stable-looking anonymous user id (`-<n>`) for stream
/// requests that carry no resolved identity. The concrete encoding is part
/// of the external `cmd.onConnect` contract, not an implementation detail.
pub(crate) fn next_anonymous_id() -> String {
    let n = ANON_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("-{n}")
}

/// The in-memory event broker.
///
/// Cheaply `Clone`-able: holds only an `Arc`'d registry and a `Clone`
/// config, so it can be shared across axum handlers via `State`.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<Registry>,
    config: BrokerConfig,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Build a broker from its configuration.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    /// This broker's configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register a fully-built subscription: insert it into all five
    /// indices, wire its `HandleUnregister` callback, and run the
    /// `OnSubscribe` hook.
    ///
    /// If the hook rejects the subscription the indices are **not**
    /// rolled back (see the error policy note on [`BrokerError`]); the
    /// caller is expected to dispose the subscription itself, which will
    /// drive the unregister path through the callback installed here.
    #[tracing::instrument(skip(self, sub), fields(sub_id = %sub.id()))]
    pub fn register(&self, sub: &Arc<Subscription>) -> Result<(), BrokerError> {
        let _guard = sub.monitor.lock();
        self.registry.insert_all(sub);

        let registry = self.registry.clone();
        let weak = Arc::downgrade(sub);
        let hooks = self.config.hooks.clone();
        let notify_channel = self.config.notify_channel_of_subscriptions;
        sub.set_on_unsubscribe(Box::new(move || {
            if let Some(sub) = weak.upgrade() {
                let _guard = sub.monitor.lock();
                registry.remove_all(&sub);
                hooks.on_unsubscribe(&sub);
                sub.dispose();
                if notify_channel {
                    let payload = sub.meta_payload();
                    for peer in registry.by_channel(sub.channel()) {
                        peer.publish(SELECTOR_ON_LEAVE, Some(payload.clone()));
                    }
                }
                tracing::debug!(sub_id = %sub.id(), "subscription unregistered");
            }
        }));

        tracing::debug!("subscription registered");

        if let Err(err) = self.config.hooks.on_subscribe(sub) {
            tracing::warn!(error = %err, "OnSubscribe hook rejected subscription");
            return Err(err);
        }

        if self.config.notify_channel_of_subscriptions {
            // Reaches the newly-joined subscriber itself, not just its
            // channel peers: its second frame after `cmd.onConnect`.
            let payload = sub.meta_payload();
            for peer in self.registry.by_channel(sub.channel()) {
                peer.publish(SELECTOR_ON_JOIN, Some(payload.clone()));
            }
        }

        Ok(())
    }

    /// Explicitly unregister the subscription identified by `sub_id`, if
    /// still present. No-op (and logged) if the id is unknown — unregister
    /// is inherently racy against opportunistic expiry.
    pub fn handle_unregister(&self, sub_id: &str) {
        match self.registry.get_by_sub_id(sub_id) {
            Some(sub) => sub.unsubscribe(),
            None => tracing::debug!(sub_id, "unregister requested for unknown subscription"),
        }
    }

    /// Record a heartbeat pulse for `sub_id`. Unknown ids are logged and
    /// ignored.
    pub fn pulse(&self, sub_id: &str) {
        match self.registry.get_by_sub_id(sub_id) {
            Some(sub) => sub.pulse(),
            None => tracing::debug!(sub_id, "heartbeat for unknown subscription"),
        }
    }

    /// Publish to every live subscription.
    pub fn notify_all(&self, selector: &str, payload: Option<Value>) {
        self.notify_targets(&self.registry.all(), None, selector, payload);
    }

    /// Publish to every subscriber of `channel`.
    pub fn notify_channel(&self, channel: &str, selector: &str, payload: Option<Value>) {
        self.notify_targets(&self.registry.by_channel(channel), None, selector, payload);
    }

    /// Publish to every subscription belonging to `user_id`, optionally
    /// restricted to one `channel_filter`.
    pub fn notify_user_id(
        &self,
        user_id: &str,
        channel_filter: Option<&str>,
        selector: &str,
        payload: Option<Value>,
    ) {
        self.notify_targets(&self.registry.by_user_id(user_id), channel_filter, selector, payload);
    }

    /// Publish to every subscription belonging to `user_name`, optionally
    /// restricted to one `channel_filter`.
    pub fn notify_user_name(
        &self,
        user_name: &str,
        channel_filter: Option<&str>,
        selector: &str,
        payload: Option<Value>,
    ) {
        self.notify_targets(&self.registry.by_user_name(user_name), channel_filter, selector, payload);
    }

    /// Publish to every subscription belonging to `session_id`, optionally
    /// restricted to one `channel_filter`.
    pub fn notify_session(
        &self,
        session_id: &str,
        channel_filter: Option<&str>,
        selector: &str,
        payload: Option<Value>,
    ) {
        self.notify_targets(&self.registry.by_session(session_id), channel_filter, selector, payload);
    }

    /// Publish to exactly one subscription, if still present and — when
    /// `channel_filter` is set — a member of that channel.
    pub fn notify_subscription(
        &self,
        sub_id: &str,
        channel_filter: Option<&str>,
        selector: &str,
        payload: Option<Value>,
    ) {
        match self.registry.get_by_sub_id(sub_id) {
            Some(sub) if channel_filter.is_none_or(|c| sub.channel() == c) => {
                sub.publish(selector, payload);
            }
            Some(_) => {}
            None => tracing::debug!(sub_id, "notify for unknown subscription"),
        }
    }

    /// Fan a publish out to a resolved list of targets, skipping any whose
    /// `Channel` does not match `channel_filter` (`None` matches any
    /// channel). Any matching target whose `LastPulseAt` has exceeded
    /// `config.timeout` still receives this frame — it is only reaped once
    /// the whole fan-out has completed, so expiry is detected during the
    /// pass but acted on after it.
    fn notify_targets(
        &self,
        targets: &[Arc<Subscription>],
        channel_filter: Option<&str>,
        selector: &str,
        payload: Option<Value>,
    ) {
        let now = crate::now_millis();
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let mut expired = Vec::new();
        for sub in targets {
            if channel_filter.is_some_and(|c| sub.channel() != c) {
                continue;
            }
            let age = now.saturating_sub(sub.last_pulse_at());
            if age > timeout_ms {
                expired.push(sub.clone());
            }
            sub.publish(selector, payload.clone());
        }
        for sub in expired {
            tracing::debug!(sub_id = %sub.id(), "reaping expired subscription after publish");
            sub.unsubscribe();
        }
    }

    /// Administrative sweep: eagerly reap every subscription whose
    /// `LastPulseAt` has exceeded the configured timeout, independent of
    /// any publish. Additive: the broker never calls this itself, it
    /// exists for host applications that want a background reaper instead
    /// of relying purely on opportunistic expiry.
    pub fn sweep_expired(&self) -> usize {
        let now = crate::now_millis();
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let mut reaped = 0;
        for sub in self.registry.all() {
            if now.saturating_sub(sub.last_pulse_at()) > timeout_ms {
                sub.unsubscribe();
                reaped += 1;
            }
        }
        reaped
    }

    /// Snapshot of every live subscription's `Meta` map, for the admin
    /// subscribers listing. Optionally filtered to one channel.
    pub fn snapshot(&self, channel: Option<&str>) -> Vec<Value> {
        let subs = match channel {
            Some(channel) => self.registry.by_channel(channel),
            None => self.registry.all(),
        };
        subs.iter().map(|sub| sub.meta_payload()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::NewSubscription;
    use tokio::sync::mpsc;

    fn registered(broker: &Broker, channel: &str, user_id: &str) -> (Arc<Subscription>, mpsc::UnboundedReceiver<axum::response::sse::Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Arc::new(Subscription::new(NewSubscription {
            id: None,
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            user_name: String::new(),
            session_id: String::new(),
            display_name: String::new(),
            is_authenticated: false,
            profile_url: String::new(),
            sender: tx,
        }));
        broker.register(&sub).unwrap();
        (sub, rx)
    }

    #[tokio::test]
    async fn register_then_notify_channel_delivers() {
        crate::setup_tracing();
        let broker = Broker::new(BrokerConfig {
            notify_channel_of_subscriptions: false,
            ..BrokerConfig::default()
        });
        let (_sub, mut rx) = registered(&broker, "lobby", "u1");
        broker.notify_channel("lobby", "chat.msg", Some(serde_json::json!({"t": "hi"})));
        let frame = rx.recv().await.unwrap().to_string();
        assert!(frame.contains("chat.msg"));
    }

    #[tokio::test]
    async fn join_notification_reaches_existing_channel_peers() {
        let broker = Broker::new(BrokerConfig::default());
        let (_first, mut first_rx) = registered(&broker, "lobby", "u1");
        let (_second, _second_rx) = registered(&broker, "lobby", "u2");

        let frame = first_rx.recv().await.unwrap().to_string();
        assert!(frame.contains(super::SELECTOR_ON_JOIN));
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_registry_and_notifies_leave() {
        let broker = Broker::new(BrokerConfig::default());
        let (first, mut first_rx) = registered(&broker, "lobby", "u1");
        let _ = first_rx.recv().await; // drain join-notification noise, if any
        let (second, _second_rx) = registered(&broker, "lobby", "u2");
        let _ = first_rx.recv().await; // the onJoin for `second`

        second.unsubscribe();
        let frame = first_rx.recv().await.unwrap().to_string();
        assert!(frame.contains(super::SELECTOR_ON_LEAVE));
        assert_eq!(broker.snapshot(None).len(), 1);
        let _ = first;
    }

    #[test]
    fn handle_unregister_on_unknown_id_does_not_panic() {
        let broker = Broker::new(BrokerConfig::default());
        broker.handle_unregister("does-not-exist");
    }

    #[test]
    fn pulse_on_unknown_id_does_not_panic() {
        let broker = Broker::new(BrokerConfig::default());
        broker.pulse("does-not-exist");
    }

    #[tokio::test]
    async fn notify_delivers_final_frame_then_reaps_expired_subscriber() {
        tokio::time::pause();
        let broker = Broker::new(BrokerConfig {
            timeout: std::time::Duration::from_millis(50),
            notify_channel_of_subscriptions: false,
            ..BrokerConfig::default()
        });
        let (_sub, mut rx) = registered(&broker, "lobby", "u1");
        tokio::time::advance(std::time::Duration::from_millis(200)).await;

        broker.notify_channel("lobby", "chat.msg", None);
        let frame = rx.recv().await.unwrap().to_string();
        assert!(frame.contains("chat.msg"), "an expired subscriber still receives this one final frame");
        assert!(rx.recv().await.is_none(), "the subscriber is disposed after that frame, closing its channel");
        assert!(broker.snapshot(None).is_empty());
    }

    #[test]
    fn sweep_expired_reaps_idle_subscriptions() {
        let broker = Broker::new(BrokerConfig {
            timeout: std::time::Duration::from_millis(0),
            notify_channel_of_subscriptions: false,
            ..BrokerConfig::default()
        });
        let (_sub, _rx) = registered(&broker, "lobby", "u1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(broker.sweep_expired(), 1);
        assert!(broker.snapshot(None).is_empty());
    }

    #[test]
    fn next_anonymous_id_is_unique_per_call() {
        let a = next_anonymous_id();
        let b = next_anonymous_id();
        assert_ne!(a, b);
    }

    #[test]
    fn next_anonymous_id_uses_dash_prefix() {
        assert!(next_anonymous_id().starts_with('-'));
    }

    #[tokio::test]
    async fn notify_user_id_respects_channel_filter() {
        crate::setup_tracing();
        let broker = Broker::new(BrokerConfig {
            notify_channel_of_subscriptions: false,
            ..BrokerConfig::default()
        });
        let (_lobby, mut lobby_rx) = registered(&broker, "lobby", "u1");
        let (_game, mut game_rx) = registered(&broker, "game", "u1");

        broker.notify_user_id("u1", Some("lobby"), "chat.msg", None);

        assert!(lobby_rx.recv().await.unwrap().to_string().contains("chat.msg"));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), game_rx.recv())
                .await
                .is_err(),
            "the game-channel subscription must not receive a lobby-filtered notify"
        );
    }

    #[tokio::test]
    async fn notify_subscription_with_mismatched_channel_filter_is_skipped() {
        crate::setup_tracing();
        let broker = Broker::new(BrokerConfig {
            notify_channel_of_subscriptions: false,
            ..BrokerConfig::default()
        });
        let (sub, mut rx) = registered(&broker, "lobby", "u1");

        broker.notify_subscription(sub.id().as_ref(), Some("game"), "chat.msg", None);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err(),
            "channel filter mismatch must suppress delivery"
        );

        broker.notify_subscription(sub.id().as_ref(), Some("lobby"), "chat.msg", None);
        assert!(rx.recv().await.unwrap().to_string().contains("chat.msg"));
    }
}
