//! The multi-index registry: five logically identical lookup tables over
//! the same live [`Subscription`]s, keyed by subscription id, channel,
//! user id, user name and session id respectively.
//!
//! Each index is a `key -> SlotArray` map behind an `RwLock`, using a plain
//! `HashMap` rather than a `BTreeMap` since nothing here depends on key
//! ordering.

mod slots;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::subscription::Subscription;
use slots::SlotArray;

/// A single `key -> SlotArray` index map.
struct IndexMap {
    entries: RwLock<HashMap<String, Arc<SlotArray>>>,
}

impl IndexMap {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert `sub` under `key`, creating the key's array if absent.
    ///
    /// The "does this key exist" check and the "create it" step are not
    /// atomic with respect to each other, but the race is harmless: two
    /// racing creators both build a fresh one-element array, and the
    /// `HashMap::entry` compare-and-insert (via `or_insert_with`) ensures
    /// only one ever becomes visible — the loser's instance is simply
    /// dropped, its single subscription un-lost because the loser then
    /// falls through to the found-entry `insert` path below.
    fn insert(&self, key: &str, sub: Arc<Subscription>) {
        let existing = self.entries.read().get(key).cloned();
        if let Some(array) = existing {
            array.insert(sub);
            return;
        }
        let mut guard = self.entries.write();
        match guard.get(key) {
            Some(array) => array.insert(sub),
            None => {
                guard.insert(key.to_string(), Arc::new(SlotArray::with_first(sub)));
            }
        }
    }

    fn remove(&self, key: &str, sub: &Arc<Subscription>) {
        if let Some(array) = self.entries.read().get(key) {
            array.remove(sub);
        }
    }

    /// All live subscriptions under `key`; empty if the key was never
    /// registered or every subscriber since departed.
    fn snapshot(&self, key: &str) -> Vec<Arc<Subscription>> {
        match self.entries.read().get(key) {
            Some(array) => array.snapshot(),
            None => Vec::new(),
        }
    }

    /// All live subscriptions across every key in this index.
    fn snapshot_all(&self) -> Vec<Arc<Subscription>> {
        self.entries
            .read()
            .values()
            .flat_map(|array| array.snapshot())
            .collect()
    }
}

/// The five-index registry of live subscriptions.
///
/// Each subscription lives in up to five arrays simultaneously: always
/// `by_sub_id`, and then `by_channel` / `by_user_id` / `by_user_name` /
/// `by_session` when the corresponding identity field is non-empty. Blank
/// identity fields are never inserted — notifying an empty key would
/// otherwise fan out to every subscription that happens to share "no user
/// id".
pub(crate) struct Registry {
    by_sub_id: IndexMap,
    by_channel: IndexMap,
    by_user_id: IndexMap,
    by_user_name: IndexMap,
    by_session: IndexMap,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            by_sub_id: IndexMap::new(),
            by_channel: IndexMap::new(),
            by_user_id: IndexMap::new(),
            by_user_name: IndexMap::new(),
            by_session: IndexMap::new(),
        }
    }

    /// Insert `sub` into every applicable index.
    pub(crate) fn insert_all(&self, sub: &Arc<Subscription>) {
        self.by_sub_id.insert(sub.id().as_ref(), sub.clone());
        self.by_channel.insert(sub.channel(), sub.clone());
        if !sub.user_id().is_empty() {
            self.by_user_id.insert(sub.user_id(), sub.clone());
        }
        if !sub.user_name().is_empty() {
            self.by_user_name.insert(sub.user_name(), sub.clone());
        }
        if !sub.session_id().is_empty() {
            self.by_session.insert(sub.session_id(), sub.clone());
        }
    }

    /// Remove `sub` from every index it was inserted into. Safe to call
    /// more than once.
    pub(crate) fn remove_all(&self, sub: &Arc<Subscription>) {
        self.by_sub_id.remove(sub.id().as_ref(), sub);
        self.by_channel.remove(sub.channel(), sub);
        if !sub.user_id().is_empty() {
            self.by_user_id.remove(sub.user_id(), sub);
        }
        if !sub.user_name().is_empty() {
            self.by_user_name.remove(sub.user_name(), sub);
        }
        if !sub.session_id().is_empty() {
            self.by_session.remove(sub.session_id(), sub);
        }
    }

    /// Look up a single subscription by id.
    pub(crate) fn get_by_sub_id(&self, id: &str) -> Option<Arc<Subscription>> {
        self.by_sub_id.snapshot(id).into_iter().next()
    }

    pub(crate) fn by_channel(&self, channel: &str) -> Vec<Arc<Subscription>> {
        self.by_channel.snapshot(channel)
    }

    pub(crate) fn by_user_id(&self, user_id: &str) -> Vec<Arc<Subscription>> {
        self.by_user_id.snapshot(user_id)
    }

    pub(crate) fn by_user_name(&self, user_name: &str) -> Vec<Arc<Subscription>> {
        self.by_user_name.snapshot(user_name)
    }

    pub(crate) fn by_session(&self, session_id: &str) -> Vec<Arc<Subscription>> {
        self.by_session.snapshot(session_id)
    }

    /// Every live subscription, for `notify_all` and the admin listing.
    pub(crate) fn all(&self) -> Vec<Arc<Subscription>> {
        self.by_sub_id.snapshot_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::NewSubscription;
    use tokio::sync::mpsc;

    fn sub(channel: &str, user_id: &str) -> Arc<Subscription> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Subscription::new(NewSubscription {
            id: None,
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            user_name: String::new(),
            session_id: String::new(),
            display_name: String::new(),
            is_authenticated: false,
            profile_url: String::new(),
            sender: tx,
        }))
    }

    #[test]
    fn blank_identity_fields_are_not_indexed() {
        crate::setup_tracing();
        let registry = Registry::new();
        let s = sub("lobby", "");
        registry.insert_all(&s);
        assert!(registry.by_user_id("").is_empty());
        assert_eq!(registry.by_channel("lobby").len(), 1);
    }

    #[test]
    fn remove_all_clears_every_index() {
        let registry = Registry::new();
        let s = sub("lobby", "u1");
        registry.insert_all(&s);
        assert_eq!(registry.all().len(), 1);
        registry.remove_all(&s);
        assert!(registry.all().is_empty());
        assert!(registry.by_channel("lobby").is_empty());
        assert!(registry.by_user_id("u1").is_empty());
    }

    #[test]
    fn get_by_sub_id_finds_registered_subscription() {
        let registry = Registry::new();
        let s = sub("lobby", "u1");
        registry.insert_all(&s);
        let found = registry.get_by_sub_id(s.id().as_ref()).unwrap();
        assert_eq!(found.id(), s.id());
    }

    #[test]
    fn multiple_subscribers_share_a_channel_key() {
        let registry = Registry::new();
        let a = sub("lobby", "u1");
        let b = sub("lobby", "u2");
        registry.insert_all(&a);
        registry.insert_all(&b);
        assert_eq!(registry.by_channel("lobby").len(), 2);
    }

    #[test]
    fn remove_all_is_idempotent() {
        let registry = Registry::new();
        let s = sub("lobby", "u1");
        registry.insert_all(&s);
        registry.remove_all(&s);
        registry.remove_all(&s); // must not panic
        assert!(registry.all().is_empty());
    }
}
