//! # Fake module
//!
//! This module provide in-memory implementations of the [`Api`] and
//! [`PodExec`] traits to exercise reconciliation without a cluster

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use kube::api::PropagationPolicy;
use serde_json::{json, Value};

use crate::svc::{
    k8s::{
        api::{Api, Error, Object},
        exec::{self, Output, PodExec},
        selector::Selector,
    },
    pki::{self, Pki, SshKeyPair},
};

type Key = (String, String, String);

// -----------------------------------------------------------------------------
// Store structure

#[derive(Default, Debug)]
struct Store {
    objects: BTreeMap<Key, Value>,
    deleted: Vec<(Key, String)>,
    writes: usize,
    sequence: u64,
}

// -----------------------------------------------------------------------------
// FakeApi structure

#[derive(Clone, Default, Debug)]
pub struct FakeApi {
    store: Arc<Mutex<Store>>,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.into(), name.into())
}

fn labels(value: &Value) -> BTreeMap<String, String> {
    value
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| (k.to_owned(), v.as_str().unwrap_or_default().to_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn without_version(value: &Value) -> Value {
    let mut value = value.to_owned();
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
    }
    value
}

impl FakeApi {
    /// store the object as if another actor created it
    pub fn insert<K: Object>(&self, obj: &K) {
        let mut store = self.store.lock().expect("store lock");
        store.sequence += 1;

        let mut value = serde_json::to_value(obj).expect("serializable object");
        let metadata = value["metadata"].as_object_mut().expect("metadata");
        metadata
            .entry("uid")
            .or_insert_with(|| json!(format!("uid-{}", store.sequence)));
        metadata.entry("creationTimestamp").or_insert_with(|| {
            json!(format!("2023-01-01T00:{:02}:{:02}Z", store.sequence / 60, store.sequence % 60))
        });
        metadata.insert("resourceVersion".into(), json!(store.sequence.to_string()));

        let namespace = value["metadata"]["namespace"].as_str().unwrap_or_default().to_string();
        let name = value["metadata"]["name"].as_str().unwrap_or_default().to_string();
        store.objects.insert(key::<K>(&namespace, &name), value);
    }

    /// returns the stored object
    pub fn object<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let store = self.store.lock().expect("store lock");
        store
            .objects
            .get(&key::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.to_owned()).expect("deserializable object"))
    }

    /// returns every stored object of the kind
    pub fn objects<K: Object>(&self) -> Vec<K> {
        let store = self.store.lock().expect("store lock");
        let kind = K::kind(&()).to_string();

        store
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == &kind)
            .map(|(_, value)| serde_json::from_value(value.to_owned()).expect("deserializable"))
            .collect()
    }

    /// mutate the stored object as if another controller updated it
    pub fn update<K: Object>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut obj = self.object::<K>(namespace, name).expect("object to update");
        f(&mut obj);
        self.insert(&obj);
    }

    pub fn remove<K: Object>(&self, namespace: &str, name: &str) {
        let mut store = self.store.lock().expect("store lock");
        store.objects.remove(&key::<K>(namespace, name));
    }

    /// returns the names of deleted objects of the kind
    pub fn deleted<K: Object>(&self) -> Vec<String> {
        let store = self.store.lock().expect("store lock");
        let kind = K::kind(&()).to_string();

        store
            .deleted
            .iter()
            .filter(|((k, _, _), _)| k == &kind)
            .map(|((_, _, name), _)| name.to_owned())
            .collect()
    }

    /// returns the propagation policy the object of the kind was deleted with
    pub fn propagation<K: Object>(&self, name: &str) -> Option<String> {
        let store = self.store.lock().expect("store lock");
        let kind = K::kind(&()).to_string();

        store
            .deleted
            .iter()
            .find(|((k, _, n), _)| k == &kind && n == name)
            .map(|(_, policy)| policy.to_owned())
    }

    /// returns the number of writes that changed the state of the store
    pub fn writes(&self) -> usize {
        self.store.lock().expect("store lock").writes
    }
}

#[async_trait]
impl Api for FakeApi {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        let store = self.store.lock().expect("store lock");
        match store.objects.get(&key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.to_owned())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        let store = self.store.lock().expect("store lock");
        let kind = K::kind(&()).to_string();

        store
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                k == &kind && ns == namespace && selector.matches(&labels(value))
            })
            .map(|(_, value)| Ok(serde_json::from_value(value.to_owned())?))
            .collect()
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let mut store = self.store.lock().expect("store lock");
        let mut value = serde_json::to_value(obj)?;
        let namespace = value["metadata"]["namespace"]
            .as_str()
            .ok_or(Error::MissingMetadata("namespace"))?
            .to_string();
        let name = value["metadata"]["name"]
            .as_str()
            .ok_or(Error::MissingMetadata("name"))?
            .to_string();
        let key = key::<K>(&namespace, &name);

        store.sequence += 1;
        let sequence = store.sequence;
        let existing = store.objects.get(&key).cloned();
        let metadata = value["metadata"]
            .as_object_mut()
            .ok_or(Error::MissingMetadata("metadata"))?;

        match &existing {
            Some(existing) => {
                for field in ["uid", "creationTimestamp", "resourceVersion"] {
                    if let Some(v) = existing["metadata"].get(field) {
                        metadata.insert(field.into(), v.to_owned());
                    }
                }
            }
            None => {
                metadata.insert("uid".into(), json!(format!("uid-{}", sequence)));
                metadata.insert(
                    "creationTimestamp".into(),
                    json!(format!("2023-01-01T00:{:02}:{:02}Z", sequence / 60, sequence % 60)),
                );
            }
        }

        if let (Some(existing), None) = (&existing, value.get("status")) {
            if let Some(status) = existing.get("status") {
                value["status"] = status.to_owned();
            }
        }

        let changed = existing
            .as_ref()
            .map(|existing| without_version(existing) != without_version(&value))
            .unwrap_or(true);

        if changed {
            store.writes += 1;
            value["metadata"]["resourceVersion"] = json!(sequence.to_string());
            store.objects.insert(key, value.to_owned());
        }

        let stored = store.objects.get(&self::key::<K>(&namespace, &name)).cloned();
        Ok(serde_json::from_value(stored.unwrap_or(value))?)
    }

    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        policy: PropagationPolicy,
    ) -> Result<(), Error> {
        let mut store = self.store.lock().expect("store lock");
        let key = key::<K>(namespace, name);

        if store.objects.remove(&key).is_some() {
            store.writes += 1;
            store.deleted.push((key, format!("{:?}", policy)));
        }

        Ok(())
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<K, Error> {
        let mut store = self.store.lock().expect("store lock");
        store.sequence += 1;
        let sequence = store.sequence;

        let value = store
            .objects
            .get_mut(&key::<K>(namespace, name))
            .ok_or_else(|| {
                Error::NotFound(namespace.into(), name.into(), K::kind(&()).to_string())
            })?;

        let mut patched = value.to_owned();
        json_patch::patch(&mut patched, patch)
            .map_err(|_| Error::Conflict(namespace.into(), name.into()))?;
        patched["metadata"]["resourceVersion"] = json!(sequence.to_string());
        *value = patched.to_owned();
        store.writes += 1;

        Ok(serde_json::from_value(patched)?)
    }
}

// -----------------------------------------------------------------------------
// FakeExec structure

/// records executed commands and answers with the configured result
#[derive(Clone, Default, Debug)]
pub struct FakeExec {
    failure: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl FakeExec {
    /// make subsequent commands fail with the given stderr
    pub fn fail_with(&self, stderr: &str) {
        *self.failure.lock().expect("failure lock") = Some(stderr.into());
    }

    pub fn succeed(&self) {
        *self.failure.lock().expect("failure lock") = None;
    }

    /// returns the (namespace, pod, container) of executed commands
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().expect("calls lock").to_owned()
    }
}

#[async_trait]
impl PodExec for FakeExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        _command: Vec<String>,
    ) -> Result<Output, exec::Error> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((namespace.into(), pod.into(), container.into()));

        match self.failure.lock().expect("failure lock").to_owned() {
            Some(stderr) => Err(exec::Error::Failed("command terminated".into(), stderr)),
            None => Ok(Output::default()),
        }
    }
}

// -----------------------------------------------------------------------------
// FakePki structure

#[derive(Clone, Default, Debug)]
pub struct FakePki {
    generated: Arc<Mutex<usize>>,
}

impl FakePki {
    pub fn generated(&self) -> usize {
        *self.generated.lock().expect("generated lock")
    }
}

impl Pki for FakePki {
    fn ssh_key_pair(&self) -> Result<SshKeyPair, pki::Error> {
        let mut generated = self.generated.lock().expect("generated lock");
        *generated += 1;

        Ok(SshKeyPair {
            private_key: format!("private-key-{}", generated),
            public_key: format!("ecdsa-sha2-nistp256 public-key-{}", generated),
        })
    }
}
