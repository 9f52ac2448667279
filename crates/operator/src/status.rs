use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{InitJobRecord, OdooDeployment, OdooDeploymentStatus};
use crate::error::{Error, ResourceKind, Result, StoreOp};
use crate::store::ResourceStore;

pub const RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType { OperatorDegraded, OperatorSucceeded, DatabaseInitialized }

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OperatorDegraded => "OperatorDegraded",
            Self::OperatorSucceeded => "OperatorSucceeded",
            Self::DatabaseInitialized => "DatabaseInitialized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus { True, False, Unknown }

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

/// Append-or-replace by type. The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    set_condition_at(conditions, type_, status, reason, message, generation, Utc::now())
}

pub fn set_condition_at(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        Some(existing) => {
            if existing.status != status.as_str() {
                existing.status = status.as_str().to_string();
                existing.last_transition_time = Time(now);
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = generation;
        }
        None => conditions.push(Condition {
            type_: type_.as_str().to_string(),
            status: status.as_str().to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
            last_transition_time: Time(now),
        }),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: ConditionType) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

/// A status mutation produced by a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    AdminSecret(String),
    ConfigSecret(String),
    DataPvc(String),
    InitJobStarted(InitJobRecord),
    /// The current job finished: its modules become the installed set.
    InitJobSucceeded,
    /// The current job is gone without installing anything.
    InitJobCleared,
}

impl StatusUpdate {
    pub fn apply(self, status: &mut OdooDeploymentStatus) {
        match self {
            Self::AdminSecret(name) => status.odoo_admin_secret_name = Some(name),
            Self::ConfigSecret(name) => status.odoo_config_secret_name = Some(name),
            Self::DataPvc(name) => status.odoo_data_pvc_name = Some(name),
            Self::InitJobStarted(record) => status.current_init_job = record,
            Self::InitJobSucceeded => {
                let record = std::mem::take(&mut status.current_init_job);
                status.init_modules_installed = record.modules;
            }
            Self::InitJobCleared => status.current_init_job = InitJobRecord::default(),
        }
    }
}

/// Owns the status accumulated during a pass and writes it back through the store.
pub struct StatusReporter<'a, S: ResourceStore> {
    store: &'a S,
    app: OdooDeployment,
    status: OdooDeploymentStatus,
}

impl<'a, S: ResourceStore> StatusReporter<'a, S> {
    pub fn new(store: &'a S, app: OdooDeployment) -> Self {
        let status = app.status.clone().unwrap_or_default();
        Self { store, app, status }
    }

    /// The App Deployment as loaded; its status is the last persisted one.
    pub fn app(&self) -> &OdooDeployment { &self.app }

    pub fn status(&self) -> &OdooDeploymentStatus { &self.status }

    pub fn apply(&mut self, updates: impl IntoIterator<Item = StatusUpdate>) {
        for update in updates {
            update.apply(&mut self.status);
        }
    }

    pub fn set_condition(&mut self, type_: ConditionType, status: ConditionStatus, reason: &str, message: &str) {
        let generation = self.app.metadata.generation;
        set_condition(&mut self.status.conditions, type_, status, reason, message, generation);
    }

    /// Marks the pass as failed in `step` without writing anything.
    pub fn fail(&mut self, step: ResourceKind, err: &Error) {
        let reason = err.reason(step);
        let message = err.to_string();
        warn!(name = %self.app.name_any(), %step, reason, error = %message, "reconcile.step.failed");
        self.set_condition(ConditionType::OperatorDegraded, ConditionStatus::True, reason, &message);
        self.set_condition(ConditionType::OperatorSucceeded, ConditionStatus::False, reason, &message);
    }

    pub fn succeed(&mut self) {
        self.set_condition(ConditionType::OperatorDegraded, ConditionStatus::False, RECONCILE_SUCCEEDED, "");
        self.set_condition(ConditionType::OperatorSucceeded, ConditionStatus::True, RECONCILE_SUCCEEDED, "");
    }

    /// Writes the status and adopts the stored resourceVersion for the next write.
    pub async fn persist(&mut self) -> Result<()> {
        let name = self.app.name_any();
        self.app.status = Some(self.status.clone());
        let stored = self
            .store
            .replace_status(&self.app)
            .await
            .map_err(|e| Error::store(ResourceKind::OdooDeployment, StoreOp::UpdateStatus, &name, e))?;
        debug!(%name, resource_version = ?stored.metadata.resource_version, "status.persisted");
        self.app.metadata.resource_version = stored.metadata.resource_version;
        Ok(())
    }

    /// Persists after a failed step; a failing write is reported alongside `err`.
    pub async fn persist_with(&mut self, err: Error) -> Error {
        match self.persist().await {
            Ok(()) => err,
            Err(write) => Error::Aggregate(vec![err, write]),
        }
    }
}
