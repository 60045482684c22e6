use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

// Dead weak references are swept out of the registry whenever it grows past
// this many entries (the threshold then doubles with the live population).
const PRUNE_THRESHOLD: usize = 64;

/// One lock per key. Carries nothing but the mutex and a counter of tasks
/// that either hold it or are queued for it, so it can be thrown away and
/// recreated any time nobody references it.
#[derive(Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    holders: AtomicUsize,
}

struct Registry<K> {
    slots: HashMap<K, Weak<Slot>>,
    prune_at: usize,
}

/// Counts a task as "interested" in a key from the moment it asks for the
/// lock until the guard is dropped (or the acquiring future is cancelled).
struct Registration(Arc<Slot>);
impl Registration {
    fn new(slot: Arc<Slot>) -> Self {
        slot.holders.fetch_add(1, Ordering::SeqCst);
        Self(slot)
    }
}
impl Drop for Registration {
    fn drop(&mut self) {
        self.0.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Guard for a per-key critical section.
///
/// Releases the key's mutex, then the shared side of the global lock, then
/// the registration, in that order (struct fields drop in declaration order).
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct LocalGuard<K> {
    _local: OwnedMutexGuard<()>,
    _global: OwnedRwLockReadGuard<()>,
    _registration: Registration,
    key: K,
}
impl<K> LocalGuard<K> {
    /// The key this guard is holding.
    pub fn key(&self) -> &K {
        &self.key
    }
}

/// Guard for a global (whole-cache) critical section. While it is alive no
/// per-key section is running and none can start.
#[must_use = "the global lock is released as soon as the guard is dropped"]
pub struct GlobalGuard {
    _global: OwnedRwLockWriteGuard<()>,
}

/// Registry of per-key async mutexes plus one global lock.
///
/// - Per-key sections ([`lock_local`](Self::lock_local)) take the *shared*
///   side of the global lock and then the key's own mutex, so sections for
///   different keys run concurrently and sections for the same key run one
///   after the other, in order of arrival.
/// - Global sections ([`lock_global`](Self::lock_global)) take the
///   *exclusive* side: they wait for every per-key section in flight and
///   hold off new ones until they are done.
///
/// Neither lock is reentrant. Code that already holds a guard must not ask
/// for the same lock again; it should call whatever "already locked" variant
/// of the operation the caller exposes instead.
///
/// Per-key mutexes are kept behind [`Weak`] references, so the registry
/// never grows beyond the set of keys currently in use (plus some dead
/// entries waiting for the next sweep).
///
/// # Examples
///
/// ```
/// use mediacache_asyncutils::KeyedLock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let locks = KeyedLock::<String>::new();
/// let value = locks.with_local_lock("a".to_string(), || async { 42 }).await;
/// assert_eq!(value, 42);
/// assert!(locks.active_keys().is_empty());
/// # }
/// ```
pub struct KeyedLock<K> {
    global: Arc<RwLock<()>>,
    registry: Mutex<Registry<K>>,
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            global: Arc::new(RwLock::new(())),
            registry: Mutex::new(Registry { slots: HashMap::new(), prune_at: PRUNE_THRESHOLD }),
        }
    }

    fn slot(&self, key: &K) -> Arc<Slot> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = registry.slots.get(key).and_then(Weak::upgrade) {
            return slot;
        }
        let slot = Arc::new(Slot::default());
        registry.slots.insert(key.clone(), Arc::downgrade(&slot));
        if registry.slots.len() >= registry.prune_at {
            registry.slots.retain(|_, weak| weak.strong_count() > 0);
            registry.prune_at = (registry.slots.len() * 2).max(PRUNE_THRESHOLD);
            tracing::trace!(live = registry.slots.len(), "Pruned unused key locks");
        }
        slot
    }

    /// Acquire the lock for `key`, waiting behind any global section.
    pub async fn lock_local(&self, key: K) -> LocalGuard<K> {
        let slot = self.slot(&key);
        // Register before waiting, so that queued tasks count as active.
        let registration = Registration::new(slot.clone());
        let global = self.global.clone().read_owned().await;
        let local = slot.mutex.clone().lock_owned().await;
        LocalGuard {
            _local: local,
            _global: global,
            _registration: registration,
            key,
        }
    }

    /// Acquire the global lock, waiting for all per-key sections to finish.
    pub async fn lock_global(&self) -> GlobalGuard {
        GlobalGuard { _global: self.global.clone().write_owned().await }
    }

    /// Run `body` while holding the lock for `key`.
    pub async fn with_local_lock<F, Fut, T>(&self, key: K, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock_local(key).await;
        body().await
    }

    /// Run `body` while holding the global lock.
    pub async fn with_global_lock<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock_global().await;
        body().await
    }

    /// Snapshot of the keys that are locked, or waiting to be locked, right
    /// now.
    ///
    /// Advisory only: the answer may already be out of date by the time the
    /// caller looks at it. Good enough to *avoid* touching busy entries, not
    /// to guarantee anything.
    pub fn active_keys(&self) -> HashSet<K> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .slots
            .iter()
            .filter_map(|(key, weak)| weak.upgrade().map(|slot| (key, slot)))
            .filter(|(_, slot)| slot.holders.load(Ordering::SeqCst) > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of keys with a live lock object.
    pub fn tracked_keys(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.slots.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLock::<&'static str>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                locks
                    .with_local_lock("same", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLock::<u32>::new();
        let _held = locks.lock_local(1).await;
        // Would hang forever if key 2 shared key 1's mutex.
        let other = timeout(Duration::from_secs(1), locks.lock_local(2)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_global_waits_for_local() {
        let locks = KeyedLock::<u32>::new();
        let held = locks.lock_local(1).await;
        assert!(timeout(Duration::from_millis(50), locks.lock_global()).await.is_err());
        drop(held);
        assert!(timeout(Duration::from_secs(1), locks.lock_global()).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_waits_for_global() {
        let locks = KeyedLock::<u32>::new();
        let global = locks.lock_global().await;
        assert!(timeout(Duration::from_millis(50), locks.lock_local(1)).await.is_err());
        drop(global);
        assert!(timeout(Duration::from_secs(1), locks.lock_local(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_active_keys() {
        let locks = KeyedLock::<u32>::new();
        assert!(locks.active_keys().is_empty());
        let one = locks.lock_local(1).await;
        let two = locks.lock_local(2).await;
        assert_eq!(locks.active_keys(), HashSet::from([1, 2]));
        assert_eq!(*one.key(), 1);
        drop(one);
        assert_eq!(locks.active_keys(), HashSet::from([2]));
        drop(two);
        assert!(locks.active_keys().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_tasks_count_as_active() {
        let locks = Arc::new(KeyedLock::<u32>::new());
        let global = locks.lock_global().await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock_local(7).await;
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.active_keys(), HashSet::from([7]));
        drop(global);
        waiter.await.unwrap();
        assert!(locks.active_keys().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_not_active() {
        let locks = KeyedLock::<u32>::new();
        let global = locks.lock_global().await;
        assert!(timeout(Duration::from_millis(20), locks.lock_local(7)).await.is_err());
        assert!(locks.active_keys().is_empty());
        drop(global);
    }

    #[tokio::test]
    async fn test_unused_locks_are_dropped() {
        let locks = KeyedLock::<usize>::new();
        for key in 0..(PRUNE_THRESHOLD * 2) {
            let _guard = locks.lock_local(key).await;
        }
        assert_eq!(locks.tracked_keys(), 0);
        let registry = locks.registry.lock().unwrap();
        assert!(registry.slots.len() < PRUNE_THRESHOLD * 2);
    }
}
