//! Reference-counted, TTL-expiring cache for expensive shared handles.
//!
//! Used to share container engine clients between concurrent provision and
//! teardown operations on the same endpoint. Entries carry an activity
//! counter: checked-out entries are never expired, idle entries are dropped
//! by the sweep once older than the TTL, with a release callback so the
//! owner can close the underlying resource.
//!
//! Counter violations (double insert, decrement below zero) are reported as
//! [`CacheError`] immediately; they indicate a reference-counting bug and
//! are never swallowed.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// State-invariant violation in cache usage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("an entry for this key is already cached")]
    AlreadyCached,
    #[error("value is not tracked by this cache")]
    NotTracked,
    #[error("activity count for this entry is already zero")]
    NotInUse,
}

struct Slot<V> {
    value: V,
    active: u32,
    last_touch: Instant,
}

/// Map from key to shared value, activity counter and last-touch timestamp.
pub struct UsageTrackingCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> UsageTrackingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, bumping its activity counter, or
    /// `None` when nothing (live or not-yet-expired) is cached.
    pub fn get_and_increment_usage(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock().expect("cache mutex poisoned");
        let slot = slots.get_mut(key)?;
        slot.active += 1;
        slot.last_touch = Instant::now();
        Some(slot.value.clone())
    }

    /// Insert a new entry with an activity count of one.
    ///
    /// Fails with [`CacheError::AlreadyCached`] when the key already holds
    /// an entry; callers must probe with
    /// [`get_and_increment_usage`](Self::get_and_increment_usage) first.
    pub fn cache_and_increment_usage(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().expect("cache mutex poisoned");
        if slots.contains_key(&key) {
            return Err(CacheError::AlreadyCached);
        }
        slots.insert(
            key,
            Slot {
                value,
                active: 1,
                last_touch: Instant::now(),
            },
        );
        Ok(())
    }

    /// Release one checkout of `value`.
    ///
    /// Fails when the value is unknown ([`CacheError::NotTracked`]) or its
    /// counter already sits at zero ([`CacheError::NotInUse`]).
    pub fn decrement_usage(&self, value: &V) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().expect("cache mutex poisoned");
        let slot = slots
            .values_mut()
            .find(|slot| slot.value == *value)
            .ok_or(CacheError::NotTracked)?;
        if slot.active == 0 {
            return Err(CacheError::NotInUse);
        }
        slot.active -= 1;
        slot.last_touch = Instant::now();
        Ok(())
    }

    /// Drop entries whose counter is zero and whose last touch is older than
    /// the TTL. `release` is invoked once per dropped entry, outside the
    /// cache lock, so it may close connections without stalling other users.
    pub fn sweep(&self, release: impl FnMut(K, V)) {
        self.sweep_at(Instant::now(), release)
    }

    fn sweep_at(&self, now: Instant, mut release: impl FnMut(K, V)) {
        let expired: Vec<(K, V)> = {
            let mut slots = self.slots.lock().expect("cache mutex poisoned");
            let keys: Vec<K> = slots
                .iter()
                .filter(|(_, slot)| {
                    slot.active == 0 && now.duration_since(slot.last_touch) >= self.ttl
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| slots.remove(&k).map(|slot| (k, slot.value)))
                .collect()
        };
        for (key, value) in expired {
            release(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check out an existing entry as an RAII lease that releases on drop.
    pub fn lease(self: &Arc<Self>, key: &K) -> Option<Lease<K, V>> {
        self.get_and_increment_usage(key).map(|value| Lease {
            cache: Arc::clone(self),
            value: Some(value),
        })
    }

    /// Insert a new entry and check it out in one step.
    pub fn lease_new(self: &Arc<Self>, key: K, value: V) -> Result<Lease<K, V>, CacheError> {
        self.cache_and_increment_usage(key, value.clone())?;
        Ok(Lease {
            cache: Arc::clone(self),
            value: Some(value),
        })
    }
}

/// Scoped checkout of a cache entry; the activity counter is released when
/// the lease drops, even on the error path of the holder.
pub struct Lease<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    cache: Arc<UsageTrackingCache<K, V>>,
    value: Option<V>,
}

impl<K, V> Deref for Lease<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    type Target = V;

    fn deref(&self) -> &V {
        self.value.as_ref().expect("lease value taken")
    }
}

impl<K, V> std::fmt::Debug for Lease<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl<K, V> Drop for Lease<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    fn drop(&mut self) {
        if let Some(value) = self.value.take()
            && let Err(e) = self.cache.decrement_usage(&value)
        {
            // A failing release means the entry was tampered with behind
            // our back; losing the decrement is the symptom, not the bug.
            tracing::error!(error = %e, "cache lease release failed (refcount bug)");
        }
    }
}

/// Run the expiry sweep on an interval until the returned task is aborted.
pub fn spawn_expiry<K, V>(
    cache: Arc<UsageTrackingCache<K, V>>,
    every: Duration,
    mut release: impl FnMut(K, V) + Send + 'static,
) -> tokio::task::JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.sweep(&mut release);
        }
    })
}
