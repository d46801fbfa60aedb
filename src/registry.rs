//! A concurrency-safe keyed map.
//!
//! [`KeyedRegistry`] guards one `HashMap` with a single reader/writer lock.
//! Reads take the shared side. Writes that may turn out to be unnecessary
//! (`load_or_store`, the compare operations, `load_and_delete`) first look
//! under the shared lock and only take the exclusive lock when a change seems
//! needed, re-checking once they hold it.
//!
//! Values are handed out by clone, so they are usually cheap handles such as
//! `Arc`s. No lock is ever held while caller code runs, except inside
//! [`KeyedRegistry::call`].

use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;

use parking_lot::RwLock;

/// A map from keys to values that can be shared freely between tasks.
pub struct KeyedRegistry<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> KeyedRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the value stored for `key`, if any.
    pub fn load(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Set the value for `key`, dropping any previous value.
    pub fn store(&self, key: K, value: V) {
        self.swap(key, value);
    }

    /// Set the value for `key` and return the previous value, if any.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    /// Remove `key`. Absent keys are ignored.
    pub fn delete(&self, key: &K) {
        self.load_and_delete(key);
    }

    /// Remove `key` and return the value it held, if any.
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        if !self.entries.read().contains_key(key) {
            return None;
        }
        self.entries.write().remove(key)
    }

    /// Return the value for `key` if present, otherwise store `value` and
    /// return it.
    ///
    /// The flag is `true` when the value was already present. Among
    /// concurrent callers racing on a new key exactly one sees `false`, and
    /// every caller gets that winner's value back.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        if let Some(existing) = self.load(&key) {
            return (existing, true);
        }

        match self.entries.write().entry(key) {
            hash_map::Entry::Occupied(entry) => (entry.get().clone(), true),
            hash_map::Entry::Vacant(entry) => (entry.insert(value).clone(), false),
        }
    }

    /// Iterate the present entries without holding the lock across `visit`.
    ///
    /// The keys are snapshotted first and each value is looked up as it is
    /// visited, so no key is visited twice, entries removed in the meantime
    /// are skipped and entries added in the meantime are not seen. `visit`
    /// may call back into the registry. Return [`ControlFlow::Break`] to stop.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        for key in self.keys() {
            let Some(value) = self.load(&key) else {
                continue;
            };
            if visit(&key, &value).is_break() {
                break;
            }
        }
    }

    /// Snapshot of the keys present right now.
    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry at once by swapping in fresh storage.
    ///
    /// Values already handed out stay usable by whoever holds them.
    pub fn clear(&self) {
        let previous = std::mem::take(&mut *self.entries.write());
        drop(previous);
    }

    /// Run `f` with exclusive access to every entry.
    ///
    /// All other operations on the registry block until `f` returns, so keep
    /// it short. `f` must not call back into this registry.
    pub fn call<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Exclusive<'_, K, V>) -> R,
    {
        let mut entries = self.entries.write();
        let mut exclusive = Exclusive {
            entries: &mut *entries,
        };
        f(&mut exclusive)
    }
}

impl<K, V> KeyedRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    /// Replace the value for `key` with `new` if it currently equals `old`.
    ///
    /// Equality is the value type's `PartialEq`. Handle types that should be
    /// compared by identity, such as [`Limiter`](crate::ratelimit::Limiter),
    /// implement `PartialEq` that way.
    pub fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool {
        if self.entries.read().get(key) != Some(old) {
            return false;
        }

        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if current == old => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    /// Remove `key` if it is present and its value equals `old`.
    pub fn compare_and_delete(&self, key: &K, old: &V) -> bool {
        if self.entries.read().get(key) != Some(old) {
            return false;
        }

        let mut entries = self.entries.write();
        if entries.get(key) != Some(old) {
            return false;
        }
        entries.remove(key);
        true
    }
}

impl<K, V> Default for KeyedRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for KeyedRegistry<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedRegistry")
            .field("entries", &*self.entries.read())
            .finish()
    }
}

/// Exclusive view of a registry's entries, handed to [`KeyedRegistry::call`].
pub struct Exclusive<'a, K, V> {
    entries: &'a mut HashMap<K, V>,
}

impl<K, V> Exclusive<'_, K, V>
where
    K: Eq + Hash,
{
    /// Value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Mutable access to the value stored for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    /// Keep only the entries for which `keep` returns `true`.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.entries.retain(keep);
    }

    /// Iterate all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_load_missing_key() {
        let registry: KeyedRegistry<String, u32> = KeyedRegistry::new();
        assert_eq!(registry.load(&"missing".to_string()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_store_and_swap() {
        let registry = KeyedRegistry::new();
        registry.store("a", 1);
        assert_eq!(registry.load(&"a"), Some(1));

        assert_eq!(registry.swap("a", 2), Some(1));
        assert_eq!(registry.swap("b", 3), None);
        assert_eq!(registry.load(&"a"), Some(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_delete_and_load_and_delete() {
        let registry = KeyedRegistry::new();
        registry.store("a", 1);
        registry.store("b", 2);

        registry.delete(&"a");
        registry.delete(&"missing");
        assert_eq!(registry.load(&"a"), None);

        assert_eq!(registry.load_and_delete(&"b"), Some(2));
        assert_eq!(registry.load_and_delete(&"b"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_or_store() {
        let registry = KeyedRegistry::new();
        assert_eq!(registry.load_or_store("a", 1), (1, false));
        assert_eq!(registry.load_or_store("a", 2), (1, true));
        assert_eq!(registry.load(&"a"), Some(1));
    }

    #[test]
    fn test_load_or_store_single_winner() {
        let registry = Arc::new(KeyedRegistry::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.load_or_store("shared", Arc::new(i))
                })
            })
            .collect();

        let results: Vec<(Arc<i32>, bool)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|(_, loaded)| !loaded).count();
        assert_eq!(winners, 1);

        let stored = registry.load(&"shared").unwrap();
        for (value, _) in &results {
            assert!(Arc::ptr_eq(value, &stored));
        }
    }

    #[test]
    fn test_compare_and_swap() {
        let registry = KeyedRegistry::new();
        registry.store("a", 1);

        assert!(!registry.compare_and_swap(&"a", &5, 2));
        assert_eq!(registry.load(&"a"), Some(1));

        assert!(registry.compare_and_swap(&"a", &1, 2));
        assert_eq!(registry.load(&"a"), Some(2));

        assert!(!registry.compare_and_swap(&"missing", &0, 1));
        assert_eq!(registry.load(&"missing"), None);
    }

    #[test]
    fn test_compare_and_delete() {
        let registry = KeyedRegistry::new();
        registry.store("a", 1);

        assert!(!registry.compare_and_delete(&"a", &2));
        assert!(!registry.compare_and_delete(&"missing", &1));
        assert!(registry.compare_and_delete(&"a", &1));
        assert_eq!(registry.load(&"a"), None);
    }

    #[test]
    fn test_range_visits_each_key_once() {
        let registry = KeyedRegistry::new();
        for i in 0..10 {
            registry.store(i, i * 10);
        }

        let mut seen = Vec::new();
        registry.range(|k, v| {
            assert_eq!(*v, k * 10);
            seen.push(*k);
            ControlFlow::Continue(())
        });
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_stops_early() {
        let registry = KeyedRegistry::new();
        for i in 0..10 {
            registry.store(i, i);
        }

        let mut visits = 0;
        registry.range(|_, _| {
            visits += 1;
            if visits == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visits, 3);
    }

    #[test]
    fn test_range_is_reentrant() {
        let registry = KeyedRegistry::new();
        for i in 0..5 {
            registry.store(i, i);
        }

        let mut visited = Vec::new();
        registry.range(|k, _| {
            // mutate the registry from inside the visit
            registry.delete(&(k + 1));
            registry.store(k + 100, 0);
            visited.push(*k);
            ControlFlow::Continue(())
        });

        let mut deduped = visited.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), visited.len());
        assert!(visited.iter().all(|k| *k < 5));
    }

    #[test]
    fn test_range_with_concurrent_writers() {
        let registry = Arc::new(KeyedRegistry::new());
        for i in 0..100 {
            registry.store(i, i);
        }

        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 100..1000 {
                    registry.store(i, i);
                    registry.delete(&(i - 50));
                }
            })
        };

        // keys 50.. may be deleted mid-range; 0..50 stay for the whole call
        let mut seen = Vec::new();
        registry.range(|k, _| {
            seen.push(*k);
            ControlFlow::Continue(())
        });
        writer.join().unwrap();

        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());
        for key in 0..50 {
            assert!(seen.contains(&key), "stable key {} was not visited", key);
        }
    }

    #[test]
    fn test_clear() {
        let registry = KeyedRegistry::new();
        registry.store("a", Arc::new(7));
        registry.store("b", Arc::new(8));

        let held = registry.load(&"a").unwrap();
        registry.clear();

        assert!(registry.keys().is_empty());
        assert_eq!(registry.load(&"a"), None);
        assert_eq!(registry.load(&"b"), None);
        assert_eq!(*held, 7);
    }

    #[test]
    fn test_call_multi_step() {
        let registry = KeyedRegistry::new();
        registry.store("from", 10);
        registry.store("to", 5);

        let moved = registry.call(|entries| {
            let amount = entries.remove(&"from")?;
            *entries.get_mut(&"to")? += amount;
            Some(amount)
        });

        assert_eq!(moved, Some(10));
        assert_eq!(registry.load(&"from"), None);
        assert_eq!(registry.load(&"to"), Some(15));
    }

    #[test]
    fn test_call_retain() {
        let registry = KeyedRegistry::new();
        for i in 0..10 {
            registry.store(i, i);
        }

        registry.call(|entries| entries.retain(|_, v| *v % 2 == 0));
        assert_eq!(registry.len(), 5);
        assert!(registry.call(|entries| entries.iter().all(|(_, v)| v % 2 == 0)));
    }

    #[test]
    fn test_debug_output() {
        let registry = KeyedRegistry::new();
        registry.store("a", 1);
        assert_eq!(format!("{:?}", registry), r#"KeyedRegistry { entries: {"a": 1} }"#);
    }
}
