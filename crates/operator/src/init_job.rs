//! Lifecycle of the one-shot database initialisation job.
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::{InitJobRecord, OdooDeployment, OdooDeploymentStatus};
use crate::error::{Error, ResourceKind, StoreOp};
use crate::status::{ConditionStatus, StatusUpdate};
use crate::steps::ensure_owner;
use crate::store::{ResourceStore, StoreError};
use crate::templates;

/// Jobs default to six retries when `backoffLimit` is unset.
const DEFAULT_BACKOFF_LIMIT: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase { Pending, Running, Succeeded, Failed }

impl JobPhase {
    pub fn of(job: &Job) -> Self {
        let Some(status) = job.status.as_ref() else { return Self::Pending };
        let condition = |type_: &str| {
            status.conditions.iter().flatten().any(|c| c.type_ == type_ && c.status == "True")
        };
        if condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
            return Self::Succeeded;
        }
        if condition("Failed") {
            return Self::Failed;
        }
        let active = status.active.unwrap_or(0);
        if active > 0 {
            return Self::Running;
        }
        let limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(DEFAULT_BACKOFF_LIMIT);
        if status.failed.unwrap_or(0) > limit {
            return Self::Failed;
        }
        Self::Pending
    }
}

/// New value for the `DatabaseInitialized` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCondition {
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

impl JobCondition {
    fn new(status: ConditionStatus, reason: &'static str, message: String) -> Self {
        Self { status, reason, message }
    }
}

/// What one tracker run decided. Status updates are kept even when `error` is set.
#[derive(Debug, Default)]
pub struct TrackerOutcome {
    pub updates: Vec<StatusUpdate>,
    pub condition: Option<JobCondition>,
    /// Re-check delay while the job lifecycle is in motion.
    pub requeue: Option<Duration>,
    pub error: Option<Error>,
}

impl TrackerOutcome {
    fn failed(mut self, err: Error) -> Self {
        self.error = Some(err);
        self
    }
}

pub struct InitJobTracker {
    pub job_poll: Duration,
}

impl InitJobTracker {
    pub fn new(job_poll: Duration) -> Self { Self { job_poll } }

    /// Advances the init job by one transition and, when idle, starts a job if
    /// the installed modules differ from the desired ones.
    pub async fn track<S: ResourceStore>(&self, store: &S, app: &OdooDeployment, status: &OdooDeploymentStatus) -> TrackerOutcome {
        let mut outcome = TrackerOutcome::default();
        let record = &status.current_init_job;
        if !record.is_idle() {
            let ns = if record.namespace.is_empty() { app.namespace_or_default() } else { record.namespace.clone() };
            let live = match store.get::<Job>(&ns, &record.name).await {
                Ok(live) => live,
                Err(e) => return outcome.failed(Error::store(ResourceKind::InitJob, StoreOp::Get, &record.name, e)),
            };
            match live {
                None => {
                    info!(job = %record.name, "init_job.missing");
                    outcome.updates.push(StatusUpdate::InitJobCleared);
                }
                Some(job) => return self.advance(store, &ns, record, &job, outcome).await,
            }
        }
        self.start_if_needed(store, app, &status.init_modules_installed, outcome).await
    }

    async fn advance<S: ResourceStore>(
        &self,
        store: &S,
        ns: &str,
        record: &InitJobRecord,
        job: &Job,
        mut outcome: TrackerOutcome,
    ) -> TrackerOutcome {
        let phase = JobPhase::of(job);
        debug!(job = %record.name, ?phase, "init_job.observed");
        match phase {
            JobPhase::Pending | JobPhase::Running => {
                outcome.condition = Some(JobCondition::new(
                    ConditionStatus::Unknown,
                    "InitJobRunning",
                    format!("init job {} is still running", record.name),
                ));
            }
            JobPhase::Succeeded => {
                info!(job = %record.name, modules = ?record.modules, "init_job.succeeded");
                outcome.updates.push(StatusUpdate::InitJobSucceeded);
                outcome.condition = Some(JobCondition::new(
                    ConditionStatus::True,
                    "InitJobSucceeded",
                    format!("init job {} installed {}", record.name, record.modules.join(",")),
                ));
                if let Err(e) = remove_job(store, ns, &record.name).await {
                    return outcome.failed(e);
                }
            }
            JobPhase::Failed => {
                warn!(job = %record.name, "init_job.failed");
                outcome.updates.push(StatusUpdate::InitJobCleared);
                outcome.condition = Some(JobCondition::new(
                    ConditionStatus::False,
                    "InitJobFailed",
                    format!("init job {} failed; it will be recreated", record.name),
                ));
                if let Err(e) = remove_job(store, ns, &record.name).await {
                    return outcome.failed(e);
                }
            }
        }
        outcome.requeue = Some(self.job_poll);
        outcome
    }

    async fn start_if_needed<S: ResourceStore>(
        &self,
        store: &S,
        app: &OdooDeployment,
        installed: &[String],
        mut outcome: TrackerOutcome,
    ) -> TrackerOutcome {
        if !needs_init(installed, &app.spec.modules) {
            return outcome;
        }
        let ns = app.namespace_or_default();
        let (mut job, modules) = templates::init_job(app);
        ensure_owner(&mut job, app);
        let name = job.name_any();
        match store.create(&ns, &job).await {
            Ok(_) => info!(job = %name, modules = %modules.join(","), "init_job.created"),
            Err(StoreError::Conflict(_)) => match reusable(store, &ns, &name, &modules).await {
                Ok(true) => info!(job = %name, "init_job.adopted"),
                Ok(false) => {
                    outcome.condition = Some(JobCondition::new(
                        ConditionStatus::Unknown,
                        "InitJobReplaced",
                        format!("stale init job {name} removed; a new one follows"),
                    ));
                    outcome.requeue = Some(self.job_poll);
                    return outcome;
                }
                Err(e) => return outcome.failed(e),
            },
            Err(e) => return outcome.failed(Error::store(ResourceKind::InitJob, StoreOp::Create, &name, e)),
        }
        outcome.updates.push(StatusUpdate::InitJobStarted(InitJobRecord { name: name.clone(), namespace: ns, modules }));
        outcome.condition = Some(JobCondition::new(ConditionStatus::Unknown, "InitJobCreated", format!("init job {name} created")));
        outcome.requeue = Some(self.job_poll);
        outcome
    }
}

/// A job is needed when nothing is installed yet or the installed list differs
/// in length from the desired one. An empty desired list never starts a job.
pub fn needs_init(installed: &[String], desired: &[String]) -> bool {
    !desired.is_empty() && (installed.is_empty() || installed.len() != desired.len())
}

/// Modules passed to `--init` by the job's container.
pub fn job_modules(job: &Job) -> Option<Vec<String>> {
    let pod = job.spec.as_ref()?.template.spec.as_ref()?;
    let command = pod.containers.first()?.command.as_ref()?;
    let at = command.iter().position(|arg| arg == "--init")?;
    let modules = command.get(at + 1)?;
    Some(modules.split(',').filter(|m| !m.is_empty()).map(str::to_string).collect())
}

/// Whether an existing job of the same name can stand in for a fresh one: it
/// must still be in flight and initialise exactly `modules`. Anything else is
/// removed so the next pass creates a new job.
async fn reusable<S: ResourceStore>(store: &S, ns: &str, name: &str, modules: &[String]) -> Result<bool, Error> {
    let existing = store
        .get::<Job>(ns, name)
        .await
        .map_err(|e| Error::store(ResourceKind::InitJob, StoreOp::Get, name, e))?;
    let Some(job) = existing else { return Ok(false) };
    let phase = JobPhase::of(&job);
    let in_flight = matches!(phase, JobPhase::Pending | JobPhase::Running);
    if in_flight && job_modules(&job).as_deref() == Some(modules) {
        return Ok(true);
    }
    warn!(job = name, ?phase, "init_job.stale");
    remove_job(store, ns, name).await?;
    Ok(false)
}

/// Deletes the job's pods, then the job.
async fn remove_job<S: ResourceStore>(store: &S, ns: &str, job: &str) -> Result<(), Error> {
    let selector = format!("job-name={job}");
    let pods = store
        .list::<Pod>(ns, &selector)
        .await
        .map_err(|e| Error::store(ResourceKind::InitJobPod, StoreOp::List, job, e))?;
    for pod in pods {
        let pod_name = pod.name_any();
        debug!(job, pod = %pod_name, "init_job.pod.delete");
        store
            .delete::<Pod>(ns, &pod_name)
            .await
            .map_err(|e| Error::store(ResourceKind::InitJobPod, StoreOp::Delete, &pod_name, e))?;
    }
    store
        .delete::<Job>(ns, job)
        .await
        .map_err(|e| Error::store(ResourceKind::InitJob, StoreOp::Delete, job, e))
}
