//! In-process [`ObjectStore`] for exercising reconcilers without a cluster.
//! Test support, only built with the `testing` feature.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    store::{Object, ObjectStore},
};

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    failing_applies: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeSet<String>>,
    writes: AtomicUsize,
    next_uid: AtomicUsize,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).into_owned(),
        namespace.to_owned(),
        name.to_owned(),
    )
}

fn is_failing(names: &Mutex<BTreeSet<String>>, name: &str) -> bool {
    names
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(name)
}

fn injected_failure(action: &str, name: &str) -> Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_owned(),
        message: format!("injected failure {action} {name}"),
        reason: "InternalError".to_owned(),
        code: 500,
    })
    .into()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `obj` as-is apart from assigning a uid; not counted as a write.
    pub fn insert<K: Object>(&self, mut obj: K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(self.fresh_uid());
        }
        self.objects()
            .insert(key::<K>(&namespace, &name), serde_json::to_value(&obj)?);
        Ok(obj)
    }

    pub fn object<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects()
            .get(&key::<K>(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Sorted names of every stored `K` in `namespace`.
    pub fn list_names<K: Object>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&());
        self.objects()
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Number of apply and delete calls that reached the store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every later apply of an object called `name` fail.
    pub fn fail_applies_to(&self, name: &str) {
        self.failing_applies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned());
    }

    /// Makes every later delete of an object called `name` fail.
    pub fn fail_deletes_of(&self, name: &str) {
        self.failing_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned());
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<Key, Value>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_uid(&self) -> String {
        format!("uid-{}", self.next_uid.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.objects()
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        let kind = K::kind(&());
        self.objects()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn apply<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        if is_failing(&self.failing_applies, name) {
            return Err(injected_failure("applying", name));
        }

        let mut obj = obj.clone();
        let existing_uid = self
            .object::<K>(namespace, name)
            .and_then(|cur| cur.meta().uid.clone());
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_owned());
        meta.name = Some(name.to_owned());
        meta.uid = Some(existing_uid.unwrap_or_else(|| self.fresh_uid()));

        self.objects()
            .insert(key::<K>(namespace, name), serde_json::to_value(&obj)?);
        Ok(obj)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if is_failing(&self.failing_deletes, name) {
            return Err(injected_failure("deleting", name));
        }
        self.objects().remove(&key::<K>(namespace, name));
        Ok(())
    }
}
