use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::config::ReconcileConfig;
use crate::crd::OdooDeployment;
use crate::error::{Error, ResourceKind, Result, StoreOp};
use crate::init_job::InitJobTracker;
use crate::resolver::admin_password;
use crate::status::{ConditionType, StatusReporter};
use crate::steps::{
    converge, AdminSecretStep, ConfigSecretStep, Dependent, FilestoreStep, ServiceRole, ServiceStep, WorkloadStep,
};
use crate::store::ResourceStore;

/// Runs one convergence pass per call. Passes for the same key must not overlap.
pub struct Reconciler<S: ResourceStore> {
    pub store: S,
    pub config: ReconcileConfig,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(store: S, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Converges every dependent of `namespace/name`. `Ok(Some(d))` asks for a
    /// re-check after `d`; a deleted App Deployment yields `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Option<Duration>> {
        let Some(app) = self
            .store
            .get::<OdooDeployment>(namespace, name)
            .await
            .map_err(|e| Error::store(ResourceKind::OdooDeployment, StoreOp::Get, name, e))?
        else {
            debug!("reconcile.gone");
            return Ok(None);
        };
        let mut reporter = StatusReporter::new(&self.store, app);

        let admin_secret = self.step(&mut reporter, &AdminSecretStep).await?;
        let password = match admin_password(&admin_secret) {
            Ok(password) => password,
            Err(err) => return Err(fail(&mut reporter, ResourceKind::ConfigSecret, err).await),
        };
        self.step(&mut reporter, &ConfigSecretStep { admin_password: password }).await?;
        self.step(&mut reporter, &FilestoreStep).await?;

        let tracker = InitJobTracker::new(self.config.requeue_job_poll);
        let outcome = tracker.track(&self.store, reporter.app(), reporter.status()).await;
        reporter.apply(outcome.updates);
        if let Some(c) = &outcome.condition {
            reporter.set_condition(ConditionType::DatabaseInitialized, c.status, c.reason, &c.message);
        }
        if let Some(err) = outcome.error {
            return Err(fail(&mut reporter, ResourceKind::InitJob, err).await);
        }
        reporter.persist().await?;
        if outcome.requeue.is_some() && self.config.gate_workload_on_init_job {
            debug!(requeue = ?outcome.requeue, "reconcile.waiting_for_init_job");
            return Ok(outcome.requeue);
        }

        self.step(&mut reporter, &WorkloadStep).await?;
        self.step(&mut reporter, &ServiceStep(ServiceRole::Http)).await?;
        self.step(&mut reporter, &ServiceStep(ServiceRole::Poll)).await?;

        reporter.succeed();
        reporter.persist().await?;
        info!("reconcile.succeeded");
        Ok(outcome.requeue)
    }

    /// Converges one dependent and persists the status either way.
    async fn step<D: Dependent>(&self, reporter: &mut StatusReporter<'_, S>, step: &D) -> Result<D::Object> {
        match converge(&self.store, reporter.app(), step).await {
            Ok(converged) => {
                reporter.apply(step.recorded(converged.object.name_any()));
                reporter.persist().await?;
                Ok(converged.object)
            }
            Err(err) => Err(fail(reporter, step.resource(), err).await),
        }
    }
}

async fn fail<S: ResourceStore>(reporter: &mut StatusReporter<'_, S>, step: ResourceKind, err: Error) -> Error {
    reporter.fail(step, &err);
    reporter.persist_with(err).await
}
