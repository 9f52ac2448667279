//! In-memory store and fixtures shared by unit and integration tests.
//! The store keeps objects as JSON, records every call, and enforces
//! resourceVersion checks the way the API server does.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::Resource;
use serde_json::{json, Value};

use crate::crd::OdooDeployment;
use crate::store::{parse_selector, Managed, ResourceStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb { Get, Create, Replace, Delete, List, ReplaceStatus }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    failures: Vec<(Verb, String)>,
    version: u64,
}

impl Inner {
    fn record(&mut self, verb: Verb, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.calls.push(Call { verb, kind: kind.into(), namespace: namespace.into(), name: name.into() });
        if self.failures.iter().any(|(v, k)| *v == verb && k == kind) {
            return Err(StoreError::Request(format!("injected {verb:?} failure for {kind}")));
        }
        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Stamps a fresh resourceVersion, plus namespace and uid when missing.
    fn stamp(&mut self, value: &mut Value, namespace: &str, name: &str) {
        let version = self.next_version();
        let meta = &mut value["metadata"];
        meta["namespace"] = json!(namespace);
        meta["resourceVersion"] = json!(version);
        if meta.get("uid").map_or(true, Value::is_null) {
            meta["uid"] = json!(format!("uid-{name}-{version}"));
        }
    }
}

fn kind_of<K: Managed>() -> String {
    K::kind(&()).to_string()
}

fn name_of<K: Managed>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

fn version_of(value: &Value) -> Option<&str> {
    value["metadata"]["resourceVersion"].as_str()
}

fn decode<K: Managed>(value: Value) -> Result<K, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Request(format!("decode: {e}")))
}

fn encode<K: Managed>(obj: &K) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Request(format!("encode: {e}")))
}

fn labels_match(value: &Value, selector: &str) -> bool {
    let labels = &value["metadata"]["labels"];
    parse_selector(selector).into_iter().all(|(k, v)| labels[k].as_str() == Some(v))
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds an object without recording a call.
    pub fn insert<K: Managed>(&self, obj: K) -> K {
        let ns = obj.meta().namespace.clone().unwrap_or_else(|| "default".into());
        let name = name_of(&obj);
        let mut value = serde_json::to_value(&obj).expect("encode fixture");
        let mut inner = self.lock();
        inner.stamp(&mut value, &ns, &name);
        inner.objects.insert((kind_of::<K>(), ns, name), value.clone());
        serde_json::from_value(value).expect("decode fixture")
    }

    pub fn object<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.lock();
        let value = inner.objects.get(&(kind_of::<K>(), namespace.into(), name.into()))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Mutates a stored object in place, as another actor would.
    pub fn modify<K: Managed>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        let Some(value) = inner.objects.get(&key).cloned() else { panic!("no {key:?} to modify") };
        let mut obj: K = serde_json::from_value(value).expect("decode stored object");
        f(&mut obj);
        let mut value = serde_json::to_value(&obj).expect("encode modified object");
        inner.stamp(&mut value, namespace, name);
        inner.objects.insert(key, value);
    }

    pub fn count<K: Managed>(&self, namespace: &str) -> usize {
        let kind = kind_of::<K>();
        self.lock().objects.keys().filter(|(k, ns, _)| *k == kind && ns == namespace).count()
    }

    /// Makes every `verb` on `kind` fail until [`MemoryStore::heal`].
    pub fn fail_on(&self, verb: Verb, kind: &str) {
        self.lock().failures.push((verb, kind.to_string()));
    }

    pub fn heal(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Creates, replaces and deletes of dependent objects.
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.verb, Verb::Create | Verb::Replace | Verb::Delete))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.record(Verb::Get, &kind, namespace, name)?;
        inner.objects.get(&(kind, namespace.into(), name.into())).cloned().map(decode::<K>).transpose()
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let (kind, name) = (kind_of::<K>(), name_of(obj));
        let mut inner = self.lock();
        inner.record(Verb::Create, &kind, namespace, &name)?;
        let key = (kind.clone(), namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{kind} {name} already exists")));
        }
        let mut value = encode(obj)?;
        inner.stamp(&mut value, namespace, &name);
        inner.objects.insert(key, value.clone());
        decode(value)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let (kind, name) = (kind_of::<K>(), name_of(obj));
        let mut inner = self.lock();
        inner.record(Verb::Replace, &kind, namespace, &name)?;
        let key = (kind.clone(), namespace.to_string(), name.clone());
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::Request(format!("{kind} {name} not found")))?;
        let mut value = encode(obj)?;
        let sent = version_of(&value).map(str::to_string);
        if sent.is_some() && sent.as_deref() != version_of(&stored) {
            return Err(StoreError::Conflict(format!("{kind} {name} has been modified")));
        }
        value["metadata"]["resourceVersion"] = stored["metadata"]["resourceVersion"].clone();
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        value["metadata"]["namespace"] = json!(namespace);
        if value == stored {
            return decode(stored);
        }
        value["metadata"]["resourceVersion"] = json!(inner.next_version());
        inner.objects.insert(key, value.clone());
        decode(value)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.record(Verb::Delete, &kind, namespace, name)?;
        inner.objects.remove(&(kind, namespace.into(), name.into()));
        Ok(())
    }

    async fn list<K: Managed>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.record(Verb::List, &kind, namespace, selector)?;
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, selector))
            .map(|(_, v)| decode(v.clone()))
            .collect()
    }

    async fn replace_status(&self, app: &OdooDeployment) -> Result<OdooDeployment, StoreError> {
        let kind = OdooDeployment::kind(&()).to_string();
        let namespace = app.namespace_or_default();
        let name = app.instance_name();
        let mut inner = self.lock();
        inner.record(Verb::ReplaceStatus, &kind, &namespace, &name)?;
        let key = (kind.clone(), namespace, name.clone());
        let mut stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::Request(format!("{kind} {name} not found")))?;
        let sent = app.metadata.resource_version.as_deref();
        if sent.is_some() && sent != version_of(&stored) {
            return Err(StoreError::Conflict(format!("{kind} {name} has been modified")));
        }
        let status = serde_json::to_value(&app.status).map_err(|e| StoreError::Request(format!("encode: {e}")))?;
        if stored["status"] != status {
            stored["status"] = status;
            stored["metadata"]["resourceVersion"] = json!(inner.next_version());
            inner.objects.insert(key, stored.clone());
        }
        decode(stored)
    }
}

/// An App Deployment whose database password comes from `db-creds/password`.
pub fn sample_app(name: &str, namespace: &str) -> OdooDeployment {
    let spec = serde_json::from_value(json!({
        "name": name,
        "database": {
            "host": "postgres.db.svc",
            "passwordFromSecret": {"name": "db-creds", "key": "password"}
        },
        "modules": ["base"]
    }))
    .expect("valid sample spec");
    let mut app = OdooDeployment::new(name, spec);
    app.metadata.namespace = Some(namespace.into());
    app.metadata.uid = Some(format!("uid-{name}"));
    app.metadata.generation = Some(1);
    app
}

pub fn db_secret(namespace: &str, name: &str, pairs: &[(&str, &str)]) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.into());
    secret.metadata.namespace = Some(namespace.into());
    secret.data = Some(pairs.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect());
    secret
}
