use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::{self, watcher};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::OdooDeployment;
use crate::error::Error;
use crate::events::{route, Change, ChangeFilter, Watched};
use crate::reconciler::Reconciler;
use crate::store::KubeStore;

pub struct Context {
    pub reconciler: Reconciler<KubeStore>,
    pub resync: Duration,
}

async fn reconcile(app: Arc<OdooDeployment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = app.namespace_or_default();
    match ctx.reconciler.reconcile(&namespace, &app.name_any()).await? {
        Some(delay) => Ok(Action::requeue(delay)),
        None => Ok(Action::requeue(ctx.resync)),
    }
}

fn error_policy(app: Arc<OdooDeployment>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = err.requeue_after(&ctx.reconciler.config);
    warn!(name = %app.name_any(), error = %err, requeue_secs = delay.as_secs(), "reconcile.failed");
    Action::requeue(delay)
}

/// Maps a watched object to the App Deployments it affects. Only secrets
/// depend on the kind of event, so other kinds route every notification.
fn mapper<K>(apps: Store<OdooDeployment>) -> impl Fn(K) -> Vec<ObjectRef<OdooDeployment>> + Send + Sync + 'static
where
    K: Into<Watched>,
{
    move |obj: K| {
        let change = Change::Created(obj.into());
        let keys = route(&change, apps.state().iter().map(|app| app.as_ref()));
        if !keys.is_empty() {
            debug!(kind = ?change.current().kind(), object = %change.current().name(), targets = keys.len(), "watch.routed");
        }
        keys.into_iter().map(ObjectRef::from).collect()
    }
}

/// Reconcile triggers from a dedicated secret watch. Deletions are seen as
/// such, and updates that leave the payload untouched trigger nothing.
fn secret_triggers(
    api: Api<Secret>,
    wc: watcher::Config,
    apps: Store<OdooDeployment>,
) -> impl Stream<Item = ObjectRef<OdooDeployment>> + Send + 'static {
    let mut filter = ChangeFilter::new();
    watcher(api, wc).default_backoff().flat_map(move |event| {
        let state = apps.state();
        let apps = state.iter().map(|app| app.as_ref());
        let keys = match event {
            Ok(watcher::Event::Apply(secret) | watcher::Event::InitApply(secret)) => filter.applied(secret.into(), apps),
            Ok(watcher::Event::Delete(secret)) => {
                debug!(secret = %secret.name_any(), "watch.secret.deleted");
                filter.deleted(secret.into(), apps)
            }
            Ok(watcher::Event::Init | watcher::Event::InitDone) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "watch.secrets.failed");
                BTreeSet::new()
            }
        };
        stream::iter(keys.into_iter().map(ObjectRef::from).collect::<Vec<_>>())
    })
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()> + DeserializeOwned,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Runs the controller until a termination signal arrives.
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let ns = config.namespace.as_deref();
    let wc = watcher::Config::default();
    let controller = Controller::new(api::<OdooDeployment>(&client, ns), wc.clone());
    let apps = controller.store();
    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(KubeStore::new(client.clone()), config.reconcile.clone()),
        resync: config.resync,
    });
    info!(namespace = ns.unwrap_or("*"), concurrency = config.concurrency, "controller.starting");
    controller
        .reconcile_on(secret_triggers(api::<Secret>(&client, ns), wc.clone(), apps.clone()))
        .watches(api::<PersistentVolumeClaim>(&client, ns), wc.clone(), mapper(apps.clone()))
        .watches(api::<Deployment>(&client, ns), wc.clone(), mapper(apps.clone()))
        .watches(api::<Service>(&client, ns), wc.clone(), mapper(apps.clone()))
        .watches(api::<Job>(&client, ns), wc, mapper(apps))
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(name = %obj.name, namespace = ?obj.namespace, "reconcile.done"),
                Err(e) => debug!(error = %e, "controller.event"),
            }
        })
        .await;
    info!("controller.stopped");
    Ok(())
}
