//! Resource lifecycle registry.
//!
//! Owns every live backing resource, keyed by [`ResourceKey`]. One
//! registry is built at server start and shared by reference with the
//! providers and request handlers.
//!
//! Locking: creation holds the lifecycle lock shared and teardown holds
//! it exclusively, so a teardown waits for in-flight starts and nothing
//! is inserted behind its back. Within creation, a per-key mutex held
//! across the factory call and `Resource::start` makes concurrent
//! requesters for the same key block instead of starting duplicates,
//! while requesters for other keys proceed. The index maps sit behind
//! their own `RwLock`. Factories and `start` must not call back into
//! the registry.

pub mod docker;

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ipc::protocol::ResourceDescriptor;
use crate::resolver::Properties;
use crate::scope::Scope;

/// Errors raised by a resource while starting or closing.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("container error: {0}")]
    Container(#[from] testcontainers::TestcontainersError),
    #[error("{0}")]
    Start(String),
}

/// Registry error type.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to create {key}: {source}")]
    Create {
        key: String,
        #[source]
        source: ResourceError,
    },
    #[error("failed to start {key}: {source}")]
    Start {
        key: String,
        #[source]
        source: ResourceError,
    },
    #[error("resource {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// A provisioned backing resource.
pub trait Resource: Send + Sync + 'static {
    /// Bring the resource up. Runs once, before the resource is shared.
    fn start(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Descriptive data for listings.
    fn info(&self) -> ResourceInfo;

    /// Tear the resource down. Called at most once by the registry.
    fn close(&self) -> Result<(), ResourceError>;
}

/// What a resource reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Image (or other artifact) the resource was built from.
    pub image: String,
    /// Runtime identifier, e.g. a container id.
    pub id: String,
}

/// Unique, monotonically increasing registration number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a live resource. Requests with equal keys share one
/// resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Owning provider.
    pub owner: String,
    /// Logical resource name within the owner.
    pub name: String,
    pub scope: Scope,
    /// Canonical text form of the creation parameters.
    pub params: BTreeMap<String, String>,
}

impl ResourceKey {
    pub fn new(owner: &str, name: &str, scope: Scope, params: &Properties) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            scope,
            params: params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@[{}]", self.owner, self.name, self.scope)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "{{{}}}", params.join(", "))?;
        }
        Ok(())
    }
}

/// A registry entry as seen by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub key: ResourceKey,
    pub info: ResourceInfo,
}

impl ResourceSnapshot {
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            name: self.key.name.clone(),
            image_name: self.info.image.clone(),
            id: self.info.id.clone(),
            scope: self.key.scope.to_string(),
        }
    }
}

/// One shared resource, held both as a trait object (for teardown and
/// listing) and as `Any` (for typed lookups).
#[derive(Clone)]
struct Entry {
    id: ResourceId,
    handle: Arc<dyn Resource>,
    any: Arc<dyn Any + Send + Sync>,
}

impl Entry {
    fn new<R: Resource>(resource: R) -> Self {
        let resource = Arc::new(resource);
        Self {
            id: ResourceId::next(),
            handle: resource.clone(),
            any: resource,
        }
    }

    fn downcast<R: Resource>(&self) -> Option<Arc<R>> {
        self.any.clone().downcast::<R>().ok()
    }
}

#[derive(Default)]
struct Maps {
    by_key: HashMap<ResourceKey, Entry>,
    /// Requested property name → keys of resources that answered it,
    /// in first-answer order.
    by_property: HashMap<String, Vec<ResourceKey>>,
}

impl Maps {
    fn index(&mut self, property: &str, key: &ResourceKey) {
        let keys = self.by_property.entry(property.to_string()).or_default();
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }

    fn unindex(&mut self, removed: &HashSet<ResourceKey>) {
        self.by_property.retain(|_, keys| {
            keys.retain(|k| !removed.contains(k));
            !keys.is_empty()
        });
    }
}

/// The resource lifecycle registry.
#[derive(Default)]
pub struct ResourceRegistry {
    /// Shared by creation, exclusive for teardown.
    lifecycle: RwLock<()>,
    maps: RwLock<Maps>,
    key_locks: Mutex<HashMap<ResourceKey, Arc<Mutex<()>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the resource registered under `key`, creating and starting
    /// it with `factory` if there is none.
    ///
    /// `requested_property` is recorded in the reverse index either way.
    /// A failed creation or start leaves nothing behind: the next call
    /// retries from scratch.
    pub fn get_or_create<R, F>(
        &self,
        requested_property: &str,
        key: ResourceKey,
        factory: F,
    ) -> Result<Arc<R>, RegistryError>
    where
        R: Resource,
        F: FnOnce() -> Result<R, ResourceError>,
    {
        let _lifecycle = self.lifecycle.read().unwrap_or_else(PoisonError::into_inner);
        let key_lock = self.key_lock(&key);
        let result = {
            let _creating = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.find_or_start(requested_property, &key, factory)
        };
        self.release_key_lock(&key, key_lock);
        result
    }

    fn find_or_start<R, F>(
        &self,
        requested_property: &str,
        key: &ResourceKey,
        factory: F,
    ) -> Result<Arc<R>, RegistryError>
    where
        R: Resource,
        F: FnOnce() -> Result<R, ResourceError>,
    {
        let existing = {
            let mut maps = self.write();
            let entry = maps.by_key.get(key).cloned();
            if entry.is_some() {
                maps.index(requested_property, key);
            }
            entry
        };
        if let Some(entry) = existing {
            tracing::trace!(%key, "reusing resource");
            return entry.downcast().ok_or_else(|| RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<R>(),
            });
        }

        tracing::info!(%key, property = requested_property, "creating resource");
        let mut resource = factory().map_err(|source| RegistryError::Create {
            key: key.to_string(),
            source,
        })?;
        if let Err(source) = resource.start() {
            if let Err(e) = resource.close() {
                tracing::warn!(%key, error = %e, "cleanup after failed start failed");
            }
            return Err(RegistryError::Start {
                key: key.to_string(),
                source,
            });
        }

        let entry = Entry::new(resource);
        let typed = entry.downcast::<R>().ok_or_else(|| RegistryError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<R>(),
        })?;
        let info = entry.handle.info();
        {
            let mut maps = self.write();
            maps.index(requested_property, key);
            maps.by_key.insert(key.clone(), entry);
        }
        tracing::info!(%key, id = %info.id, image = %info.image, "resource started");
        Ok(typed)
    }

    /// Close every resource whose scope is `scope` or a descendant of it.
    ///
    /// Returns whether anything was closed. Unknown scopes are a no-op.
    pub fn close_scope(&self, scope: &Scope) -> bool {
        let _teardown = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        let removed: Vec<(ResourceKey, Entry)> = {
            let mut maps = self.write();
            let keys: HashSet<ResourceKey> = maps
                .by_key
                .keys()
                .filter(|key| scope.includes(&key.scope))
                .cloned()
                .collect();
            if keys.is_empty() {
                return false;
            }
            maps.unindex(&keys);
            keys.into_iter()
                .filter_map(|key| maps.by_key.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        tracing::info!(%scope, count = removed.len(), "closing scope");
        close_entries(removed);
        true
    }

    /// Close every resource. Shared networks go with their last
    /// container.
    pub fn close_all(&self) -> bool {
        let _teardown = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        let removed: Vec<(ResourceKey, Entry)> = {
            let mut maps = self.write();
            maps.by_property.clear();
            maps.by_key.drain().collect()
        };
        if removed.is_empty() {
            return false;
        }
        tracing::info!(resources = removed.len(), "closing all resources");
        close_entries(removed);
        true
    }

    /// Live resources of type `R` within `scope` that have answered
    /// `property`, in first-answer order.
    pub fn find_by_requested_property<R: Resource>(
        &self,
        scope: &Scope,
        property: &str,
    ) -> Vec<Arc<R>> {
        let maps = self.read();
        let Some(keys) = maps.by_property.get(property) else {
            return Vec::new();
        };
        keys.iter()
            .filter(|key| scope.includes(&key.scope))
            .filter_map(|key| maps.by_key.get(key))
            .filter_map(Entry::downcast)
            .collect()
    }

    /// Snapshot of resources within `scope`, oldest first.
    pub fn list(&self, scope: &Scope) -> Vec<ResourceSnapshot> {
        let maps = self.read();
        let mut snapshots: Vec<ResourceSnapshot> = maps
            .by_key
            .iter()
            .filter(|(key, _)| scope.includes(&key.scope))
            .map(|(key, entry)| ResourceSnapshot {
                id: entry.id,
                key: key.clone(),
                info: entry.handle.info(),
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_lock(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Forget the lock for `key` once no other requester holds it.
    fn release_key_lock(&self, key: &ResourceKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.len())
            .finish_non_exhaustive()
    }
}

fn close_entries(entries: Vec<(ResourceKey, Entry)>) {
    for (key, entry) in entries {
        match entry.handle.close() {
            Ok(()) => tracing::debug!(%key, "resource closed"),
            Err(e) => tracing::warn!(%key, error = %e, "failed to close resource"),
        }
    }
}
