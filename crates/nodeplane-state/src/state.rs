//! Resource graph store
//!
//! Resources live in one bucket per (namespace, type). Each bucket keeps its
//! resources ordered by id and a generation counter published through a
//! `tokio::sync::watch` channel. Watchers are level-triggered: they learn that
//! *something* in the kind changed and re-read current state, several changes
//! may collapse into a single wake-up.
//!
//! Every write is a compare-and-set on the resource version. `modify` is the
//! read-transform-write loop built on top of it and retries on conflict.

use chrono::Utc;
use dashmap::DashMap;
use nodeplane_core::{Error, Resource, ResourceKind, ResourceRef, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, trace};

struct Bucket {
    items: BTreeMap<String, Resource>,
    generation: watch::Sender<u64>,
}

impl Bucket {
    fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            items: BTreeMap::new(),
            generation,
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// The node's single resource store.
pub struct State {
    buckets: DashMap<ResourceKind, Bucket>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    fn with_bucket<R>(&self, kind: &ResourceKind, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut bucket = self.buckets.entry(kind.clone()).or_insert_with(Bucket::new);
        f(bucket.value_mut())
    }

    /// Latest committed version of a resource.
    pub fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        self.buckets
            .get(&reference.kind())
            .and_then(|bucket| bucket.items.get(&reference.id).cloned())
            .ok_or_else(|| Error::NotFound(reference.to_string()))
    }

    pub fn get_typed<T: DeserializeOwned>(&self, reference: &ResourceRef) -> Result<T> {
        self.get(reference)?.spec_as()
    }

    /// All resources of a kind, ordered by id.
    pub fn list(&self, kind: &ResourceKind) -> Vec<Resource> {
        self.buckets
            .get(kind)
            .map(|bucket| bucket.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert a new resource at version 1.
    pub fn create(&self, mut resource: Resource) -> Result<Resource> {
        let reference = resource.reference().clone();
        self.with_bucket(&reference.kind(), |bucket| {
            if bucket.items.contains_key(&reference.id) {
                return Err(Error::AlreadyExists(reference.to_string()));
            }
            resource.metadata.version = 1;
            resource.metadata.updated = Utc::now();
            bucket.items.insert(reference.id.clone(), resource.clone());
            bucket.bump();
            trace!(resource = %reference, "created");
            Ok(resource)
        })
    }

    /// Replace a resource if its committed version is still `expected_version`.
    pub fn update(&self, expected_version: u64, mut resource: Resource) -> Result<Resource> {
        let reference = resource.reference().clone();
        self.with_bucket(&reference.kind(), |bucket| {
            let current = bucket
                .items
                .get_mut(&reference.id)
                .ok_or_else(|| Error::NotFound(reference.to_string()))?;
            if current.metadata.version != expected_version {
                return Err(Error::Conflict {
                    resource: reference.to_string(),
                    expected: expected_version,
                    actual: current.metadata.version,
                });
            }
            resource.metadata.version = expected_version + 1;
            resource.metadata.updated = Utc::now();
            *current = resource.clone();
            bucket.bump();
            trace!(resource = %reference, version = resource.metadata.version, "updated");
            Ok(resource)
        })
    }

    pub fn destroy(&self, reference: &ResourceRef) -> Result<()> {
        self.with_bucket(&reference.kind(), |bucket| {
            bucket
                .items
                .remove(&reference.id)
                .ok_or_else(|| Error::NotFound(reference.to_string()))?;
            bucket.bump();
            trace!(resource = %reference, "destroyed");
            Ok(())
        })
    }

    /// Create-or-update through a transform of the current spec.
    ///
    /// An absent resource is presented to `transform` as JSON `null`. When the
    /// transform leaves an existing spec (and owner) untouched nothing is
    /// written and the version stays where it was.
    pub fn modify<F>(&self, reference: &ResourceRef, owner: Option<&str>, mut transform: F) -> Result<Resource>
    where
        F: FnMut(&mut serde_json::Value) -> Result<()>,
    {
        loop {
            match self.get(reference) {
                Ok(current) => {
                    let mut spec = current.spec.clone();
                    transform(&mut spec)?;
                    let owner_unchanged = owner.is_none() || current.owner() == owner;
                    if spec == current.spec && owner_unchanged {
                        return Ok(current);
                    }
                    let mut next = current.clone();
                    next.spec = spec;
                    if let Some(owner) = owner {
                        next.metadata.owner = Some(owner.to_string());
                    }
                    match self.update(current.version(), next) {
                        Ok(written) => return Ok(written),
                        Err(e) if e.is_conflict() || e.is_not_found() => {
                            debug!(resource = %reference, "modify raced with another writer, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_not_found() => {
                    let mut spec = serde_json::Value::Null;
                    transform(&mut spec)?;
                    let mut resource = Resource::new(reference.clone(), spec);
                    resource.metadata.owner = owner.map(String::from);
                    match self.create(resource) {
                        Ok(written) => return Ok(written),
                        Err(Error::AlreadyExists(_)) => {
                            debug!(resource = %reference, "concurrent create, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Typed `modify`: the zero value of an absent resource is `T::default()`.
    pub fn modify_typed<T, F>(&self, reference: &ResourceRef, owner: Option<&str>, mut transform: F) -> Result<Resource>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> Result<()>,
    {
        self.modify(reference, owner, |spec| {
            let mut typed: T = if spec.is_null() {
                T::default()
            } else {
                serde_json::from_value(spec.clone())?
            };
            transform(&mut typed)?;
            *spec = serde_json::to_value(&typed)?;
            Ok(())
        })
    }

    /// Subscribe to changes of a kind. The kind does not need to exist yet.
    pub fn watch(&self, kind: &ResourceKind) -> Watch {
        let rx = self.with_bucket(kind, |bucket| bucket.generation.subscribe());
        Watch {
            kind: kind.clone(),
            rx,
        }
    }
}

/// Level-triggered change notification for one kind.
pub struct Watch {
    kind: ResourceKind,
    rx: watch::Receiver<u64>,
}

impl Watch {
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Number of committed changes to the kind so far.
    pub fn generation(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Wait until the kind changes after the last observed generation.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::ConnectionClosed(format!("state for {} dropped", self.kind)))
    }
}
