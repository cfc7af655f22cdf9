//! Named registries of pools and workshops
//!
//! Readers load an immutable snapshot of the map via `ArcSwap` and never
//! block. Writers clone the snapshot, modify it and swap it in, one at a
//! time. An instance that is replaced or removed is closed once it is no
//! longer reachable through the registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::pool::Pool;
use crate::resource::Resource;
use crate::workshop::{Worker, Workshop};

/// Something a [`Registry`] can shut down.
pub trait Closeable: Clone + Send + Sync + 'static {
    /// Shut the instance down. Failures are logged, not returned.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Whether both handles refer to the same underlying instance.
    fn same_instance(&self, other: &Self) -> bool;
}

impl<R: Resource> Closeable for Pool<R> {
    async fn close(&self) {
        if let Err(err) = Pool::close(self).await {
            tracing::warn!(pool = %self.name(), error = %err, "pool close failed");
        }
    }

    fn same_instance(&self, other: &Self) -> bool {
        Pool::same_instance(self, other)
    }
}

impl<W: Worker> Closeable for Workshop<W> {
    async fn close(&self) {
        Workshop::close(self).await;
    }

    fn same_instance(&self, other: &Self) -> bool {
        Workshop::same_instance(self, other)
    }
}

/// Named pools.
pub type Pools<R> = Registry<Pool<R>>;

/// Named workshops.
pub type Workshops<W> = Registry<Workshop<W>>;

/// A name → instance map with lock-free reads.
pub struct Registry<T: Closeable> {
    map: ArcSwap<HashMap<String, T>>,
    /// Serializes read-modify-swap cycles.
    write: Mutex<()>,
}

impl<T: Closeable> Default for Registry<T> {
    fn default() -> Self {
        Self {
            map: ArcSwap::from_pointee(HashMap::new()),
            write: Mutex::new(()),
        }
    }
}

impl<T: Closeable> Registry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an instance by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<T> {
        self.map.load().get(name).cloned()
    }

    /// Registered names, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.map.load().keys().cloned().collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    /// Register `value` under `name`, closing any instance it replaces.
    ///
    /// Re-registering a handle to the instance already stored under `name`
    /// leaves it open.
    pub async fn insert(&self, name: impl Into<String>, value: T) {
        let name = name.into();
        let replaced = self.update(|map| map.insert(name.clone(), value.clone()));
        if let Some(old) = replaced
            && !old.same_instance(&value)
        {
            tracing::debug!(name = %name, "replacing registered instance");
            old.close().await;
        }
    }

    /// Unregister and close the instance under `name`.
    ///
    /// Returns `false` if nothing was registered.
    pub async fn remove(&self, name: &str) -> bool {
        match self.update(|map| map.remove(name)) {
            Some(old) => {
                tracing::debug!(name = %name, "removing registered instance");
                old.close().await;
                true
            }
            None => false,
        }
    }

    /// Unregister and close every instance.
    pub async fn clear(&self) {
        let drained = self.update(std::mem::take);
        for old in drained.into_values() {
            old.close().await;
        }
    }

    fn update<U>(&self, f: impl FnOnce(&mut HashMap<String, T>) -> U) -> U {
        let _write = self.write.lock();
        let mut next = HashMap::clone(&self.map.load());
        let out = f(&mut next);
        self.map.store(Arc::new(next));
        out
    }
}

impl<T: Closeable> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone, Default)]
    struct Counter {
        closes: Arc<AtomicUsize>,
    }

    impl Closeable for Counter {
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn same_instance(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.closes, &other.closes)
        }
    }

    #[tokio::test]
    async fn insert_replaces_and_closes_previous() {
        let registry = Registry::new();
        let first = Counter::default();
        let second = Counter::default();

        registry.insert("db", first.clone()).await;
        registry.insert("db", second.clone()).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reinserting_same_instance_keeps_it_open() {
        let registry = Registry::new();
        let counter = Counter::default();
        registry.insert("db", counter.clone()).await;
        registry.insert("db", counter.clone()).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(counter.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_closes_instance() {
        let registry = Registry::new();
        let counter = Counter::default();
        registry.insert("cache", counter.clone()).await;

        assert!(registry.remove("cache").await);
        assert!(!registry.remove("cache").await);
        assert!(registry.get("cache").is_none());
        assert_eq!(counter.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let registry = Registry::new();
        let counters: Vec<Counter> = (0..3).map(|_| Counter::default()).collect();
        for (i, counter) in counters.iter().enumerate() {
            registry.insert(format!("c{i}"), counter.clone()).await;
        }
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, ["c0", "c1", "c2"]);

        registry.clear().await;
        assert!(registry.is_empty());
        assert!(counters.iter().all(|c| c.closes.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn snapshot_survives_concurrent_write() {
        let registry = Registry::new();
        registry.insert("a", Counter::default()).await;
        let held = registry.get("a");
        registry.remove("a").await;
        assert!(held.is_some());
    }
}
