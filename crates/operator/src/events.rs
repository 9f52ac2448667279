//! Mapping of dependent-object changes to the App Deployments they affect.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use kube_runtime::reflector::ObjectRef;
use sha2::{Digest, Sha256};

use crate::crd::OdooDeployment;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppKey {
    pub namespace: String,
    pub name: String,
}

impl AppKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of(app: &OdooDeployment) -> Self {
        Self::new(app.namespace_or_default(), app.instance_name())
    }
}

impl From<AppKey> for ObjectRef<OdooDeployment> {
    fn from(key: AppKey) -> Self {
        ObjectRef::new(&key.name).within(&key.namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchedKind { Secret, Claim, Workload, Service, Job }

/// A dependent object delivered by a watch.
#[derive(Debug, Clone)]
pub enum Watched {
    Secret(Secret),
    Claim(PersistentVolumeClaim),
    Workload(Deployment),
    Service(Service),
    Job(Job),
}

impl Watched {
    pub fn kind(&self) -> WatchedKind {
        match self {
            Self::Secret(_) => WatchedKind::Secret,
            Self::Claim(_) => WatchedKind::Claim,
            Self::Workload(_) => WatchedKind::Workload,
            Self::Service(_) => WatchedKind::Service,
            Self::Job(_) => WatchedKind::Job,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Secret(o) => o.meta(),
            Self::Claim(o) => o.meta(),
            Self::Workload(o) => o.meta(),
            Self::Service(o) => o.meta(),
            Self::Job(o) => o.meta(),
        }
    }

    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_else(|| "default".into())
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }
}

impl From<Secret> for Watched { fn from(o: Secret) -> Self { Self::Secret(o) } }
impl From<PersistentVolumeClaim> for Watched { fn from(o: PersistentVolumeClaim) -> Self { Self::Claim(o) } }
impl From<Deployment> for Watched { fn from(o: Deployment) -> Self { Self::Workload(o) } }
impl From<Service> for Watched { fn from(o: Service) -> Self { Self::Service(o) } }
impl From<Job> for Watched { fn from(o: Job) -> Self { Self::Job(o) } }

#[derive(Debug, Clone)]
pub enum Change {
    Created(Watched),
    Updated { old: Watched, new: Watched },
    Deleted(Watched),
}

impl Change {
    /// The object as of this change.
    pub fn current(&self) -> &Watched {
        match self {
            Self::Created(o) | Self::Deleted(o) => o,
            Self::Updated { new, .. } => new,
        }
    }
}

/// Secret payload, compared without regard to key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: BTreeMap<String, ByteString>,
    string_data: BTreeMap<String, String>,
}

impl Payload {
    pub fn of(secret: &Secret) -> Self {
        Self {
            data: secret.data.clone().unwrap_or_default(),
            string_data: secret.string_data.clone().unwrap_or_default(),
        }
    }
}

pub fn same_payload(old: &Secret, new: &Secret) -> bool {
    Payload::of(old) == Payload::of(new)
}

/// Dependent object names per App Deployment, derived from spec and status.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    entries: HashMap<(WatchedKind, String, String), BTreeSet<AppKey>>,
}

impl OwnershipTable {
    pub fn build<'a>(apps: impl IntoIterator<Item = &'a OdooDeployment>) -> Self {
        let mut table = Self::default();
        for app in apps {
            let key = AppKey::of(app);
            let ns = key.namespace.clone();
            table.insert(WatchedKind::Secret, &ns, app.config_secret_name(), &key);
            table.insert(WatchedKind::Secret, &ns, app.admin_secret_name(), &key);
            table.insert(WatchedKind::Claim, &ns, app.filestore_claim_name(), &key);
            table.insert(WatchedKind::Workload, &ns, app.workload_name(), &key);
            table.insert(WatchedKind::Service, &ns, app.http_service_name(), &key);
            table.insert(WatchedKind::Service, &ns, app.poll_service_name(), &key);
            table.insert(WatchedKind::Job, &ns, app.init_job_name(), &key);
            if let Some(status) = &app.status {
                if let Some(claim) = &status.odoo_data_pvc_name {
                    table.insert(WatchedKind::Claim, &ns, claim.clone(), &key);
                }
                let job = &status.current_init_job;
                if !job.is_idle() {
                    let job_ns = if job.namespace.is_empty() { ns.clone() } else { job.namespace.clone() };
                    table.insert(WatchedKind::Job, &job_ns, job.name.clone(), &key);
                }
            }
        }
        table
    }

    fn insert(&mut self, kind: WatchedKind, namespace: &str, name: String, key: &AppKey) {
        self.entries.entry((kind, namespace.to_string(), name)).or_default().insert(key.clone());
    }

    pub fn owners(&self, kind: WatchedKind, namespace: &str, name: &str) -> impl Iterator<Item = &AppKey> {
        self.entries.get(&(kind, namespace.to_string(), name.to_string())).into_iter().flatten()
    }
}

fn controller_owner(obj: &Watched) -> Option<AppKey> {
    let api_version = OdooDeployment::api_version(&());
    let kind = OdooDeployment::kind(&());
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.kind == kind && r.api_version == api_version)
        .map(|r| AppKey::new(obj.namespace(), r.name.clone()))
}

/// App Deployments affected by `change`. Secret updates that leave the payload
/// untouched affect none.
pub fn route<'a>(change: &Change, apps: impl IntoIterator<Item = &'a OdooDeployment>) -> BTreeSet<AppKey> {
    if let Change::Updated { old: Watched::Secret(old), new: Watched::Secret(new) } = change {
        if same_payload(old, new) {
            return BTreeSet::new();
        }
    }
    let apps: Vec<&OdooDeployment> = apps.into_iter().collect();
    let obj = change.current();
    let (ns, name) = (obj.namespace(), obj.name());
    let mut keys: BTreeSet<AppKey> = controller_owner(obj).into_iter().collect();
    let table = OwnershipTable::build(apps.iter().copied());
    keys.extend(table.owners(obj.kind(), &ns, &name).cloned());
    if obj.kind() == WatchedKind::Secret {
        keys.extend(
            apps.iter()
                .filter(|app| app.namespace_or_default() == ns && app.uses_secret(&name))
                .map(|app| AppKey::of(app)),
        );
    }
    keys
}

/// Routes watch notifications, dropping secret updates whose payload did not
/// change. Only a SHA-256 digest of the payload is kept, and only for secrets
/// that affect at least one App Deployment.
#[derive(Debug, Default)]
pub struct ChangeFilter {
    digests: HashMap<(String, String), Vec<u8>>,
}

impl ChangeFilter {
    pub fn new() -> Self { Self::default() }

    /// App Deployments affected by an added or modified object.
    pub fn applied<'a>(&mut self, obj: Watched, apps: impl IntoIterator<Item = &'a OdooDeployment>) -> BTreeSet<AppKey> {
        let tracked = match &obj {
            Watched::Secret(secret) => Some((secret_id(secret), payload_digest(secret))),
            _ => None,
        };
        let keys = route(&Change::Created(obj), apps);
        let Some((id, digest)) = tracked else { return keys };
        if keys.is_empty() {
            self.digests.remove(&id);
            return keys;
        }
        match self.digests.insert(id, digest.clone()) {
            Some(previous) if previous == digest => BTreeSet::new(),
            _ => keys,
        }
    }

    /// App Deployments affected by a deleted object.
    pub fn deleted<'a>(&mut self, obj: Watched, apps: impl IntoIterator<Item = &'a OdooDeployment>) -> BTreeSet<AppKey> {
        if let Watched::Secret(secret) = &obj {
            self.digests.remove(&secret_id(secret));
        }
        route(&Change::Deleted(obj), apps)
    }

    pub fn tracked(&self) -> usize {
        self.digests.len()
    }
}

fn secret_id(secret: &Secret) -> (String, String) {
    let meta = secret.meta();
    (meta.namespace.clone().unwrap_or_else(|| "default".into()), meta.name.clone().unwrap_or_default())
}

fn payload_digest(secret: &Secret) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for (key, value) in secret.data.iter().flatten() {
        feed(&mut hasher, b"d", key, &value.0);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        feed(&mut hasher, b"s", key, value.as_bytes());
    }
    hasher.finalize().to_vec()
}

fn feed(hasher: &mut Sha256, tag: &[u8], key: &str, value: &[u8]) {
    hasher.update(tag);
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}
