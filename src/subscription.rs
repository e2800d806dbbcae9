//! A single client's live SSE stream: a lightweight sink handed to
//! producers that owns the wire framing and lifecycle directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::response::sse::Event;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Opaque per-process-unique subscription identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh, random subscription id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SubscriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Channel bucket used when a subscription does not specify one.
///
/// Treated as a literal channel name, not a wildcard: `notify_channel("*",
/// ...)` only reaches subscribers bucketed there, it never means "every
/// channel".
pub const UNKNOWN_CHANNEL: &str = "*";

/// Identity and state describing a single live client stream.
///
/// `meta`, `created_at` and `last_pulse_at` are the only fields mutated
/// after construction; every identity field is fixed for the life of the
/// subscription, so they are plain (non-atomic) values behind the type's
/// `Arc` rather than interior-mutable cells.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    user_id: String,
    user_name: String,
    session_id: String,
    display_name: String,
    is_authenticated: bool,

    created_at: u64,
    /// Written by `pulse`, read (with benign torn-read tolerance in the
    /// original design, made moot here by using an atomic) by `Broker::
    /// notify_index` to detect expiry.
    last_pulse_at: AtomicU64,

    meta: RwLock<HashMap<String, String>>,

    /// Monotonically increasing id assigned to each published frame.
    msg_id: AtomicU64,

    /// The response sink. `None` once disposed. Also doubles as the lock
    /// serializing Publish against Dispose.
    sender: Mutex<Option<UnboundedSender<Event>>>,

    /// Cleared before invoked: `take()` both breaks the Subscription →
    /// closure → Arc<Subscription> cycle and makes a recursive
    /// `unsubscribe()` call a no-op.
    on_unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    /// Supplied by the stream handler; invoked exactly once from `dispose`.
    on_dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    /// Guards the Register/Unregister sequence so "present in all five
    /// indices" and "absent from all five indices" are the only
    /// externally observable states.
    pub(crate) monitor: Mutex<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("user_id", &self.user_id)
            .field("is_authenticated", &self.is_authenticated)
            .finish_non_exhaustive()
    }
}

/// Construction parameters for a new [`Subscription`].
pub struct NewSubscription {
    /// Explicit subscription id, or `None` to generate a fresh one.
    pub id: Option<SubscriptionId>,
    /// Channel, or empty for [`UNKNOWN_CHANNEL`].
    pub channel: String,
    /// Resolved user id.
    pub user_id: String,
    /// Resolved user name.
    pub user_name: String,
    /// Resolved session id.
    pub session_id: String,
    /// Resolved display name.
    pub display_name: String,
    /// Whether the request carried an authenticated session.
    pub is_authenticated: bool,
    /// Resolved profile URL, seeded into `Meta`.
    pub profile_url: String,
    /// The sender half of the SSE body channel.
    pub sender: UnboundedSender<Event>,
}

impl Subscription {
    /// Build a new subscription bound to a response sink.
    pub fn new(params: NewSubscription) -> Self {
        let channel = if params.channel.is_empty() {
            UNKNOWN_CHANNEL.to_string()
        } else {
            params.channel
        };
        let now = crate::now_millis();
        let meta = crate::config::seed_meta(
            &params.user_id,
            &params.display_name,
            &params.profile_url,
        );
        Self {
            id: params.id.unwrap_or_else(SubscriptionId::generate),
            channel,
            user_id: params.user_id,
            user_name: params.user_name,
            session_id: params.session_id,
            display_name: params.display_name,
            is_authenticated: params.is_authenticated,
            created_at: now,
            last_pulse_at: AtomicU64::new(now),
            meta: RwLock::new(meta),
            msg_id: AtomicU64::new(0),
            sender: Mutex::new(Some(params.sender)),
            on_unsubscribe: Mutex::new(None),
            on_dispose: Mutex::new(None),
            monitor: Mutex::new(()),
        }
    }

    /// Subscription identity.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// The channel this subscription belongs to (never empty; see
    /// [`UNKNOWN_CHANNEL`]).
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Resolved user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Resolved user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Resolved session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Display name shown to other subscribers.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Whether this subscription came from an authenticated session.
    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    /// Creation timestamp, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Timestamp of the last `pulse()`, milliseconds since the Unix epoch.
    /// `LastPulseAt >= CreatedAt` always.
    pub fn last_pulse_at(&self) -> u64 {
        self.last_pulse_at.load(Ordering::Relaxed)
    }

    /// Snapshot of this subscription's metadata map.
    pub fn meta(&self) -> HashMap<String, String> {
        self.meta.read().clone()
    }

    /// Merge additional entries into `Meta` (used by `OnCreated` hooks and
    /// by the stream handler to seed `profileUrl`).
    pub fn update_meta(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut guard = self.meta.write();
        for (k, v) in entries {
            guard.insert(k, v);
        }
    }

    fn meta_value(&self) -> Value {
        serde_json::to_value(self.meta()).unwrap_or(Value::Null)
    }

    /// Install the callback invoked by `unsubscribe()`. Used by `Broker::
    /// register` to wire `HandleUnregister`.
    pub(crate) fn set_on_unsubscribe(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.on_unsubscribe.lock() = Some(cb);
    }

    /// Install the callback invoked once by `dispose()`. Used by the
    /// stream handler to know when to stop parking the request.
    pub fn set_on_dispose(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.on_dispose.lock() = Some(cb);
    }

    /// Publish one SSE frame: `id: <id>\ndata: <selector> <json>\n\n`.
    ///
    /// Never propagates a transport failure: on write error this logs and
    /// self-unsubscribes, then returns normally.
    pub fn publish(self: &Arc<Self>, selector: &str, payload: Option<Value>) {
        let json = match &payload {
            Some(value) => value.to_string(),
            None => String::new(),
        };
        let id = self.msg_id.fetch_add(1, Ordering::SeqCst) + 1;
        let data = if json.is_empty() {
            selector.to_string()
        } else {
            format!("{selector} {json}")
        };
        let event = Event::default().id(id.to_string()).data(data);

        let failed = {
            let guard = self.sender.lock();
            match guard.as_ref() {
                Some(tx) => tx.send(event).is_err(),
                None => false, // already disposed; nothing to do
            }
        };

        if failed {
            tracing::warn!(subscription_id = %self.id, "SSE write failed, unsubscribing");
            self.unsubscribe();
        }
    }

    /// Update `LastPulseAt` to now. No I/O.
    pub fn pulse(&self) {
        self.last_pulse_at.store(crate::now_millis(), Ordering::Relaxed);
    }

    /// Invoke `OnUnsubscribe` if set. Idempotent: the callback is taken
    /// (cleared) before being invoked, so a recursive call during `Dispose`
    /// is a no-op. Must not block on I/O.
    pub fn unsubscribe(self: &Arc<Self>) {
        let cb = self.on_unsubscribe.lock().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Close the underlying response under the write lock and invoke
    /// `OnDispose` exactly once. Errors closing the response are logged
    /// and swallowed (dropping the sender cannot itself fail, but a
    /// flush-failure-shaped error from a real transport would be handled
    /// here in the same way).
    pub fn dispose(&self) {
        {
            let mut guard = self.sender.lock();
            guard.take(); // dropping the sender closes the SSE body stream
        }
        if let Some(cb) = self.on_dispose.lock().take() {
            cb();
        }
    }

    /// Whether this subscription has already been disposed.
    pub fn is_disposed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Build the `cmd.onConnect` payload sent immediately after registration.
    pub fn on_connect_payload(&self, heartbeat_url: &str, heartbeat_interval_ms: u64) -> Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "heartbeatUrl": heartbeat_url,
            "heartbeatIntervalMs": heartbeat_interval_ms,
            "userId": self.user_id,
            "displayName": self.display_name,
            "profileUrl": self.meta().get("profileUrl").cloned().unwrap_or_default(),
        })
    }

    /// The `Meta` payload used for `cmd.onJoin` / `cmd.onLeave`.
    pub fn meta_payload(&self) -> Value {
        self.meta_value()
    }
}
