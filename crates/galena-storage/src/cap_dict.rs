//! A persistent dictionary of polymorphic objects.
//!
//! Values are live objects that keep their own durable state: each is
//! serialized by its declared field list plus a `CLS` class tag, and
//! reconstructed on read through a tag→factory [`Registry`] with an
//! injected context. Every live instance is handed a [`SaveFn`] that
//! re-persists it, so an object can checkpoint itself after each state
//! change without knowing where it is stored.
//!
//! Live instances are cached in a bounded LRU of strong references; a key
//! that falls out of the cache is re-hydrated from the store on the next
//! lookup. Relays rely on this: their whole state machine is resumable
//! from the persisted record alone.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{Result, StorageError};
use crate::lru::LruCache;

/// The serialized body of a stored object.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Re-persists the object it is bound to. The closure captures the store
/// handle and the key, so the object itself stays storage-agnostic.
pub type SaveFn = Arc<dyn Fn(JsonMap) + Send + Sync>;

/// Key under which the factory tag is stored inside each record.
const CLS_KEY: &str = "CLS";

/// The bytes-level store a [`CapDict`] persists into.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn contains(&self, key: &str) -> Result<bool>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// An in-memory [`Store`], mainly for tests.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<HashMap<String, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.map.lock().expect("store lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().expect("store lock poisoned").remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.map.lock().expect("store lock poisoned").contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .map
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// A value storable in a [`CapDict`].
pub trait Stored: Any + Send + Sync {
    /// The class tag written into the `CLS` field.
    fn tag(&self) -> &'static str;

    /// The object's persisted field list.
    fn encode(&self) -> JsonMap;

    /// Receives the save callback; the object calls it with a fresh
    /// [`Self::encode`] result after every durable state change.
    fn bind_save(&self, save: SaveFn);

    /// Upcast for downcasting through [`downcast`].
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recovers the concrete type of a stored object.
pub fn downcast<T: Stored>(obj: Arc<dyn Stored>) -> Option<Arc<T>> {
    obj.as_any().downcast::<T>().ok()
}

type Factory<C> = Box<dyn Fn(&C, JsonMap) -> Result<Arc<dyn Stored>> + Send + Sync>;

/// Tag→factory registry, populated at start-up.
///
/// Each factory rebuilds one class of stored object from its persisted
/// field list, with the ambient context (`C`) injected alongside.
pub struct Registry<C> {
    factories: HashMap<&'static str, Factory<C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: &'static str,
        factory: impl Fn(&C, JsonMap) -> Result<Arc<dyn Stored>> + Send + Sync + 'static,
    ) {
        self.factories.insert(tag, Box::new(factory));
    }

    fn make(&self, tag: &str, ctx: &C, body: JsonMap) -> Result<Arc<dyn Stored>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| StorageError::UnknownTag(tag.to_string()))?;
        factory(ctx, body)
    }
}

struct CapInner<C> {
    store: Arc<dyn Store>,
    registry: Arc<Registry<C>>,
    ctx: C,
    cache: Mutex<LruCache<String, Arc<dyn Stored>>>,
}

/// A persistent dictionary of polymorphic objects; see the module docs.
/// Cloning shares the store, registry, context and cache.
pub struct CapDict<C> {
    inner: Arc<CapInner<C>>,
}

impl<C> Clone for CapDict<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Default bound on live cached instances.
const DEFAULT_CACHE_CAPACITY: usize = 128;

impl<C: Send + Sync + 'static> CapDict<C> {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry<C>>, ctx: C) -> Self {
        Self::with_cache_capacity(store, registry, ctx, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        store: Arc<dyn Store>,
        registry: Arc<Registry<C>>,
        ctx: C,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CapInner {
                store,
                registry,
                ctx,
                cache: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    /// Returns the live instance for `key`, re-hydrating from the store if
    /// it is not cached. `None` if the store has no such key.
    pub fn get(&self, key: &str) -> Result<Option<Arc<dyn Stored>>> {
        {
            let mut cache = self.lock_cache();
            if let Some(obj) = cache.get(&key.to_string()) {
                return Ok(Some(Arc::clone(obj)));
            }
        }
        let Some(raw) = self.inner.store.get(key)? else {
            return Ok(None);
        };
        let mut body: JsonMap = serde_json::from_slice(&raw)?;
        let tag = body
            .remove(CLS_KEY)
            .and_then(|v| v.as_str().map(ToString::to_string))
            .ok_or_else(|| StorageError::UnknownTag("<missing CLS>".to_string()))?;
        let obj = self.inner.registry.make(&tag, &self.inner.ctx, body)?;
        obj.bind_save(self.save_fn(key, obj.tag()));
        self.lock_cache().insert(key.to_string(), Arc::clone(&obj));
        Ok(Some(obj))
    }

    /// Persists `obj` under `key`, binds its save callback, and caches it
    /// as the live instance.
    pub fn insert(&self, key: &str, obj: Arc<dyn Stored>) -> Result<()> {
        self.persist(key, obj.tag(), obj.encode())?;
        obj.bind_save(self.save_fn(key, obj.tag()));
        self.lock_cache().insert(key.to_string(), obj);
        Ok(())
    }

    /// Removes the key from the store and the live cache.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.lock_cache().remove(&key.to_string());
        self.inner.store.remove(key)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.inner.store.contains(key)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.inner.store.keys()
    }

    fn persist(&self, key: &str, tag: &str, mut body: JsonMap) -> Result<()> {
        body.insert(CLS_KEY.to_string(), serde_json::Value::from(tag));
        let raw = serde_json::to_vec(&body)?;
        self.inner.store.put(key, &raw)
    }

    fn save_fn(&self, key: &str, tag: &'static str) -> SaveFn {
        let dict = self.clone();
        let key = key.to_string();
        Arc::new(move |body| {
            if let Err(e) = dict.persist(&key, tag, body) {
                tracing::error!(key = %key, error = %e, "failed to persist stored object");
            }
        })
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<dyn Stored>>> {
        self.inner.cache.lock().expect("cap dict cache poisoned")
    }

    /// Drops the cached instance for `key`, forcing the next lookup to
    /// re-hydrate from the store. Test hook for crash simulation.
    pub fn evict(&self, key: &str) {
        self.lock_cache().remove(&key.to_string());
    }
}
