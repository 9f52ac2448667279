//! Convergence of the dependent objects that follow the get, compare, write pattern.
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::Resource;
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{OdooDeployment, ADMIN_PASSWORD_KEY};
use crate::error::{Error, ResourceKind, Result, StoreOp};
use crate::render::render;
use crate::resolver::resolve_connection;
use crate::status::StatusUpdate;
use crate::store::{Managed, ResourceStore};
use crate::templates;

/// A dependent object converged by [`converge`].
#[async_trait]
pub trait Dependent: Send + Sync {
    type Object: Managed;

    fn resource(&self) -> ResourceKind;

    fn name(&self, app: &OdooDeployment) -> String;

    /// Whether the object carries a controller reference to the App Deployment.
    fn owned(&self, _app: &OdooDeployment) -> bool { true }

    /// Existing objects are left exactly as found.
    fn create_only(&self) -> bool { false }

    /// The object as it should be. `live` is passed so store-assigned fields
    /// can be carried over.
    async fn desired<S: ResourceStore>(
        &self,
        store: &S,
        app: &OdooDeployment,
        live: Option<&Self::Object>,
    ) -> Result<Self::Object>;

    /// Whether any operator-owned field differs.
    fn drifted(&self, live: &Self::Object, desired: &Self::Object) -> Result<bool>;

    /// Folds the desired fields into the live object.
    fn apply(&self, live: Self::Object, desired: Self::Object) -> Self::Object;

    /// Status bookkeeping once the object has converged.
    fn recorded(&self, _name: String) -> Option<StatusUpdate> { None }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action { Created, Updated, Unchanged }

#[derive(Debug)]
pub struct Converged<K> {
    pub object: K,
    pub action: Action,
}

/// `desired` is a subset of `live`. Keys the server dropped count as covered
/// when the desired value is null or empty.
pub fn covers(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (_, Value::Null) => true,
        (Value::Object(l), Value::Object(d)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => covers(lv, dv),
            None => is_empty(dv),
        }),
        (Value::Array(l), Value::Array(d)) => l.len() == d.len() && l.iter().zip(d).all(|(lv, dv)| covers(lv, dv)),
        (l, d) => l == d,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn spec_covered<K: Managed>(live: &K, desired: &K) -> Result<bool> {
    let live = serde_json::to_value(live)?;
    let desired = serde_json::to_value(desired)?;
    Ok(covers(&live["spec"], &desired["spec"]))
}

/// Puts the controller reference to `app` on `obj`, replacing a stale one.
pub fn ensure_owner<K: Resource>(obj: &mut K, app: &OdooDeployment) {
    let Some(owner) = app.controller_owner_ref(&()) else { return };
    let refs = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r.uid == owner.uid && r.controller == Some(true)) { return; }
    refs.retain(|r| r.controller != Some(true) && r.uid != owner.uid);
    refs.push(owner);
}

fn controlled_by<K: Resource>(obj: &K, app: &OdooDeployment) -> bool {
    let uid = app.meta().uid.as_deref();
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && Some(r.uid.as_str()) == uid)
}

/// Get, build, then create or replace when drifted.
pub async fn converge<S, D>(store: &S, app: &OdooDeployment, step: &D) -> Result<Converged<D::Object>>
where
    S: ResourceStore,
    D: Dependent,
{
    let ns = app.namespace_or_default();
    let name = step.name(app);
    let resource = step.resource();
    let live = store
        .get::<D::Object>(&ns, &name)
        .await
        .map_err(|e| Error::store(resource, StoreOp::Get, &name, e))?;
    let mut desired = step.desired(store, app, live.as_ref()).await?;
    match live {
        None => {
            if step.owned(app) { ensure_owner(&mut desired, app); }
            let object = store
                .create(&ns, &desired)
                .await
                .map_err(|e| Error::store(resource, StoreOp::Create, &name, e))?;
            info!(%resource, %name, namespace = %ns, "dependent.created");
            Ok(Converged { object, action: Action::Created })
        }
        Some(live) if step.create_only() => {
            debug!(%resource, %name, "dependent.exists");
            Ok(Converged { object: live, action: Action::Unchanged })
        }
        Some(live) => {
            let orphaned = step.owned(app) && !controlled_by(&live, app);
            if !orphaned && !step.drifted(&live, &desired)? {
                debug!(%resource, %name, "dependent.unchanged");
                return Ok(Converged { object: live, action: Action::Unchanged });
            }
            let mut next = step.apply(live, desired);
            if step.owned(app) { ensure_owner(&mut next, app); }
            let object = store
                .replace(&ns, &next)
                .await
                .map_err(|e| Error::store(resource, StoreOp::Update, &name, e))?;
            info!(%resource, %name, namespace = %ns, "dependent.updated");
            Ok(Converged { object, action: Action::Updated })
        }
    }
}

pub struct AdminSecretStep;

#[async_trait]
impl Dependent for AdminSecretStep {
    type Object = Secret;

    fn resource(&self) -> ResourceKind { ResourceKind::AdminSecret }

    fn name(&self, app: &OdooDeployment) -> String { app.admin_secret_name() }

    /// A secret the user named is theirs.
    fn owned(&self, app: &OdooDeployment) -> bool { app.user_admin_secret_name().is_none() }

    async fn desired<S: ResourceStore>(&self, _store: &S, app: &OdooDeployment, live: Option<&Secret>) -> Result<Secret> {
        let fresh = templates::admin_secret(app);
        let Some(live) = live else { return Ok(fresh) };
        let mut desired = live.clone();
        let data = desired.data.get_or_insert_with(Default::default);
        if !data.contains_key(ADMIN_PASSWORD_KEY) {
            data.extend(fresh.data.unwrap_or_default());
        }
        Ok(desired)
    }

    fn drifted(&self, live: &Secret, _desired: &Secret) -> Result<bool> {
        Ok(!live.data.as_ref().is_some_and(|d| d.contains_key(ADMIN_PASSWORD_KEY)))
    }

    fn apply(&self, _live: Secret, desired: Secret) -> Secret { desired }

    fn recorded(&self, name: String) -> Option<StatusUpdate> { Some(StatusUpdate::AdminSecret(name)) }
}

pub struct ConfigSecretStep {
    pub admin_password: String,
}

#[async_trait]
impl Dependent for ConfigSecretStep {
    type Object = Secret;

    fn resource(&self) -> ResourceKind { ResourceKind::ConfigSecret }

    fn name(&self, app: &OdooDeployment) -> String { app.config_secret_name() }

    async fn desired<S: ResourceStore>(&self, store: &S, app: &OdooDeployment, _live: Option<&Secret>) -> Result<Secret> {
        let db = resolve_connection(store, app).await?;
        Ok(templates::config_secret(app, render(&db, &app.spec.config, &self.admin_password)))
    }

    fn drifted(&self, live: &Secret, desired: &Secret) -> Result<bool> {
        Ok(live.data != desired.data)
    }

    fn apply(&self, mut live: Secret, desired: Secret) -> Secret {
        live.data = desired.data;
        live.string_data = None;
        live
    }

    fn recorded(&self, name: String) -> Option<StatusUpdate> { Some(StatusUpdate::ConfigSecret(name)) }
}

/// Create-only: an existing claim is never modified.
pub struct FilestoreStep;

#[async_trait]
impl Dependent for FilestoreStep {
    type Object = PersistentVolumeClaim;

    fn resource(&self) -> ResourceKind { ResourceKind::Filestore }

    fn name(&self, app: &OdooDeployment) -> String { app.filestore_claim_name() }

    fn create_only(&self) -> bool { true }

    async fn desired<S: ResourceStore>(
        &self,
        _store: &S,
        app: &OdooDeployment,
        live: Option<&PersistentVolumeClaim>,
    ) -> Result<PersistentVolumeClaim> {
        if live.is_none() && !app.spec.odoo_filestore.create_if_not_exists {
            return Err(Error::ClaimMissing { name: app.filestore_claim_name() });
        }
        Ok(templates::filestore_claim(app))
    }

    fn drifted(&self, _live: &PersistentVolumeClaim, _desired: &PersistentVolumeClaim) -> Result<bool> { Ok(false) }

    fn apply(&self, live: PersistentVolumeClaim, _desired: PersistentVolumeClaim) -> PersistentVolumeClaim { live }

    fn recorded(&self, name: String) -> Option<StatusUpdate> { Some(StatusUpdate::DataPvc(name)) }
}

pub struct WorkloadStep;

#[async_trait]
impl Dependent for WorkloadStep {
    type Object = Deployment;

    fn resource(&self) -> ResourceKind { ResourceKind::Workload }

    fn name(&self, app: &OdooDeployment) -> String { app.workload_name() }

    async fn desired<S: ResourceStore>(&self, _store: &S, app: &OdooDeployment, _live: Option<&Deployment>) -> Result<Deployment> {
        Ok(templates::workload(app))
    }

    fn drifted(&self, live: &Deployment, desired: &Deployment) -> Result<bool> {
        Ok(!spec_covered(live, desired)?)
    }

    fn apply(&self, mut live: Deployment, desired: Deployment) -> Deployment {
        live.spec = desired.spec;
        live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole { Http, Poll }

pub struct ServiceStep(pub ServiceRole);

#[async_trait]
impl Dependent for ServiceStep {
    type Object = Service;

    fn resource(&self) -> ResourceKind {
        match self.0 {
            ServiceRole::Http => ResourceKind::HttpService,
            ServiceRole::Poll => ResourceKind::PollService,
        }
    }

    fn name(&self, app: &OdooDeployment) -> String {
        match self.0 {
            ServiceRole::Http => app.http_service_name(),
            ServiceRole::Poll => app.poll_service_name(),
        }
    }

    async fn desired<S: ResourceStore>(&self, _store: &S, app: &OdooDeployment, live: Option<&Service>) -> Result<Service> {
        let mut desired = match self.0 {
            ServiceRole::Http => templates::http_service(app),
            ServiceRole::Poll => templates::poll_service(app),
        };
        // Cluster addressing is assigned by the store and immutable.
        if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.and_then(|l| l.spec.as_ref())) {
            spec.cluster_ip = live_spec.cluster_ip.clone();
            spec.cluster_ips = live_spec.cluster_ips.clone();
            spec.ip_families = live_spec.ip_families.clone();
            spec.ip_family_policy = live_spec.ip_family_policy.clone();
        }
        Ok(desired)
    }

    fn drifted(&self, live: &Service, desired: &Service) -> Result<bool> {
        Ok(!spec_covered(live, desired)?)
    }

    fn apply(&self, mut live: Service, desired: Service) -> Service {
        live.spec = desired.spec;
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subset_ignores_server_defaults() {
        let live = json!({"replicas": 1, "template": {"spec": {"dnsPolicy": "ClusterFirst", "containers": [{"name": "odoo", "resources": {}}]}}});
        let desired = json!({"replicas": 1, "template": {"spec": {"containers": [{"name": "odoo"}]}}});
        assert!(covers(&live, &desired));
    }

    #[test]
    fn subset_detects_changed_scalars_and_lists() {
        let live = json!({"replicas": 1, "ports": [{"port": 8069}]});
        assert!(!covers(&live, &json!({"replicas": 3})));
        assert!(!covers(&live, &json!({"ports": [{"port": 8069}, {"port": 8072}]})));
        assert!(covers(&live, &json!({"selector": {}})));
        assert!(!covers(&live, &json!({"selector": {"app": "shop"}})));
    }

    #[test]
    fn owner_reference_is_added_once() {
        let mut app = crate::test_support::sample_app("shop", "erp");
        app.metadata.uid = Some("uid-1".into());
        let mut secret = Secret::default();
        ensure_owner(&mut secret, &app);
        ensure_owner(&mut secret, &app);
        let refs = secret.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "OdooDeployment");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn controller_reference_is_matched_by_uid() {
        let app = crate::test_support::sample_app("shop", "erp");
        let mut secret = Secret::default();
        assert!(!controlled_by(&secret, &app));
        ensure_owner(&mut secret, &app);
        assert!(controlled_by(&secret, &app));
        let other = crate::test_support::sample_app("blog", "erp");
        assert!(!controlled_by(&secret, &other));
    }

    #[test]
    fn workload_replica_change_is_drift() {
        let mut app = crate::test_support::sample_app("shop", "erp");
        let live = templates::workload(&app);
        app.spec.replicas = 3;
        let desired = templates::workload(&app);
        assert!(WorkloadStep.drifted(&live, &desired).unwrap());
        assert!(!WorkloadStep.drifted(&live, &live.clone()).unwrap());
    }
}
