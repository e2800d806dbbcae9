//! Grow-only, lock-free-ish slot array: the data structure backing every
//! key in every one of the registry's five indices.
//!
//! The per-key array is an `ArcSwap<Vec<Option<Arc<Subscription>>>>`, an
//! "infrequent writes, lock-free reads" shape, paired with a
//! `parking_lot::Mutex<()>` serializing in-place slot claims. Growing the
//! array is a compare-and-swap against the whole `Arc`, not a mutex
//! acquisition, so a grow races concurrent inserters via retry rather than
//! blocking them.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::subscription::Subscription;

/// Initial slot-array size for a freshly-registered key.
const DEFAULT_SIZE: usize = 2;
/// Growth factor applied to the old size when an array is full.
const GROWTH_MULTIPLIER: usize = 2;
/// Extra headroom added on top of the multiplied size.
const GROWTH_BUFFER: usize = 20;

type Slots = Vec<Option<Arc<Subscription>>>;

/// One key's grow-only array of subscriber slots.
pub(crate) struct SlotArray {
    slots: ArcSwap<Slots>,
    /// Guards the "scan for a null slot, re-check, write" sequence.
    /// Growing the array does not take this lock — it races via
    /// compare-and-swap and retries the scan on failure.
    monitor: Mutex<()>,
}

impl SlotArray {
    /// Create a fresh array of [`DEFAULT_SIZE`] with `sub` already placed
    /// at index 0.
    pub(crate) fn with_first(sub: Arc<Subscription>) -> Self {
        let mut slots: Slots = Vec::with_capacity(DEFAULT_SIZE);
        slots.push(Some(sub));
        slots.resize(DEFAULT_SIZE, None);
        Self {
            slots: ArcSwap::from_pointee(slots),
            monitor: Mutex::new(()),
        }
    }

    /// Insert `sub` into the first available slot, growing the array if
    /// every existing slot is occupied.
    ///
    /// Readers never observe a partially-populated new array: the new
    /// array (grown or not) is only installed, via `store`/CAS, after
    /// `sub` has been placed into it.
    ///
    /// A concurrent reader that already captured the pre-grow array via
    /// `snapshot()` will not observe a registrant that only lands in the
    /// post-grow extension. Accepted: the next publish picks up any
    /// snapshot taken after the grow completes.
    pub(crate) fn insert(&self, sub: Arc<Subscription>) {
        loop {
            // Step 2: try to claim an existing empty slot in place.
            {
                let _guard = self.monitor.lock();
                let current = self.slots.load_full();
                if let Some(idx) = current.iter().position(Option::is_none) {
                    let mut next = (*current).clone();
                    next[idx] = Some(sub);
                    self.slots.store(Arc::new(next));
                    return;
                }
            }

            // Step 3: no empty slot. Grow and CAS the whole array in.
            let observed = self.slots.load_full();
            if observed.iter().any(Option::is_none) {
                // Someone freed a slot between step 2 and here; retry the
                // cheap path instead of growing unnecessarily.
                continue;
            }
            let old_len = observed.len();
            let new_len = old_len * GROWTH_MULTIPLIER + GROWTH_BUFFER;
            let mut grown: Slots = Vec::with_capacity(new_len);
            grown.extend(observed.iter().cloned());
            grown.push(Some(sub.clone()));
            grown.resize(new_len, None);

            let previous = self.slots.compare_and_swap(&observed, Arc::new(grown));
            if Arc::ptr_eq(&previous, &observed) {
                return; // our grown array won the race
            }
            // CAS lost to a concurrent grower/inserter; retry from step 2.
        }
    }

    /// Remove the slot holding the exact reference `sub`, if present.
    /// Missing is not an error.
    pub(crate) fn remove(&self, sub: &Arc<Subscription>) {
        let _guard = self.monitor.lock();
        let current = self.slots.load_full();
        if let Some(idx) = current
            .iter()
            .position(|slot| matches!(slot, Some(existing) if Arc::ptr_eq(existing, sub)))
        {
            let mut next = (*current).clone();
            next[idx] = None;
            self.slots.store(Arc::new(next));
        }
    }

    /// All live (non-null) subscriptions currently in this array.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.slots.load().iter().flatten().cloned().collect()
    }

    /// Current array length. Grow-only: this is non-decreasing over the
    /// life of the `SlotArray`.
    pub(crate) fn len(&self) -> usize {
        self.slots.load().len()
    }

    /// Count of non-null slots.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.load().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dummy_sub() -> Arc<Subscription> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Subscription::new(crate::subscription::NewSubscription {
            id: None,
            channel: "c".to_string(),
            user_id: "u".to_string(),
            user_name: "n".to_string(),
            session_id: "s".to_string(),
            display_name: "d".to_string(),
            is_authenticated: false,
            profile_url: String::new(),
            sender: tx,
        }))
    }

    #[test]
    fn starts_at_default_size_with_first_slot_filled() {
        crate::setup_tracing();
        let array = SlotArray::with_first(dummy_sub());
        assert_eq!(array.len(), DEFAULT_SIZE);
        assert_eq!(array.occupied(), 1);
    }

    #[test]
    fn insert_fills_holes_before_growing() {
        let array = SlotArray::with_first(dummy_sub());
        array.insert(dummy_sub());
        assert_eq!(array.len(), DEFAULT_SIZE);
        assert_eq!(array.occupied(), 2);
    }

    #[test]
    fn insert_grows_when_full_and_never_shrinks() {
        let array = SlotArray::with_first(dummy_sub());
        array.insert(dummy_sub());
        let before_grow = array.len();
        array.insert(dummy_sub()); // array was full (size 2), must grow
        assert!(array.len() > before_grow);
        assert_eq!(array.occupied(), 3);

        let sub = dummy_sub();
        array.insert(sub.clone());
        array.remove(&sub);
        // Removal nulls a slot; it does not shrink the array.
        assert_eq!(array.occupied(), 3);
    }

    #[test]
    fn remove_missing_reference_is_a_no_op() {
        let array = SlotArray::with_first(dummy_sub());
        let stray = dummy_sub();
        array.remove(&stray);
        assert_eq!(array.occupied(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_inserts_all_land() {
        let array = Arc::new(SlotArray::with_first(dummy_sub()));
        let mut handles = Vec::new();
        for _ in 0..200 {
            let array = array.clone();
            handles.push(tokio::spawn(async move {
                array.insert(dummy_sub());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(array.occupied(), 201);
    }
}
