use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ReconcileConfig;
use crate::store::StoreError;

/// Fields of the database connection, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionField { Host, Port, User, Password, Name, Ssl, MaxConn }

impl fmt::Display for ConnectionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Port => "port",
            Self::User => "user",
            Self::Password => "password",
            Self::Name => "name",
            Self::Ssl => "ssl",
            Self::MaxConn => "maxConn",
        })
    }
}

/// Objects the operator reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    OdooDeployment,
    AdminSecret,
    ConfigSecret,
    ReferencedSecret,
    Filestore,
    InitJob,
    InitJobPod,
    Workload,
    HttpService,
    PollService,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OdooDeployment => "odoo deployment",
            Self::AdminSecret => "admin password secret",
            Self::ConfigSecret => "config secret",
            Self::ReferencedSecret => "referenced secret",
            Self::Filestore => "filestore pvc",
            Self::InitJob => "init job",
            Self::InitJobPod => "init job pod",
            Self::Workload => "deployment",
            Self::HttpService => "http service",
            Self::PollService => "poll service",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp { Get, List, Create, Update, Delete, UpdateStatus }

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::UpdateStatus => "update status of",
        })
    }
}

impl ResourceKind {
    /// Condition reason for a failed store operation on this resource.
    pub fn reason(self, op: StoreOp) -> &'static str {
        use ResourceKind::*;
        use StoreOp::*;
        match (self, op) {
            (OdooDeployment, Get | List) => "FailedToGetOdooDeployment",
            (OdooDeployment, _) => "FailedToUpdateStatus",
            (AdminSecret, Get | List) => "OdooAdminSecretNotAvailable",
            (AdminSecret, Create) => "OdooAdminSecretCreationFailed",
            (AdminSecret, _) => "OdooAdminSecretUpdateFailed",
            (ConfigSecret, Get | List) => "OdooConfigSecretNotAvailable",
            (ConfigSecret, Create) => "OdooConfigSecretCreationFailed",
            (ConfigSecret, _) => "OdooConfigSecretUpdateFailed",
            (ReferencedSecret, _) => "DbConnectionDetailsFailed",
            (Filestore, Get | List) => "PvcNotAvailable",
            (Filestore, Create) => "PvcCreationFailed",
            (Filestore, _) => "PvcUpdateFailed",
            (InitJob, Get | List) => "FailedToGetInitJob",
            (InitJob, Create) => "InitJobCreationFailed",
            (InitJob, _) => "FailedToDeleteInitJob",
            (InitJobPod, Get | List) => "FailedToListPods",
            (InitJobPod, _) => "FailedToDeletePod",
            (Workload, Get | List) => "FailedToGetDeployment",
            (Workload, Create) => "DeploymentCreationFailed",
            (Workload, _) => "DeploymentUpdateFailed",
            (HttpService, Get | List) => "FailedGetHttpService",
            (HttpService, Create) => "FailedCreateHttpService",
            (HttpService, _) => "FailedUpdateHttpService",
            (PollService, Get | List) => "FailedGetPollService",
            (PollService, Create) => "FailedCreatePollService",
            (PollService, _) => "FailedUpdatePollService",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("secret {name} not found")]
    SecretNotFound { name: String },
    #[error("key {key} not found in secret {name}")]
    KeyNotFound { name: String, key: String },
    #[error("key {key} of secret {name} is not a valid {expected}")]
    InvalidValue { name: String, key: String, expected: &'static str },
    #[error("no database password configured (set passwordFromSecret)")]
    CredentialMissing,
    #[error("failed to resolve database {field}: {source}")]
    Connection { field: ConnectionField, #[source] source: Box<Error> },
    #[error("admin password secret {secret} has no usable {key:?} key")]
    AdminPasswordMissing { secret: String, key: &'static str },
    #[error("pvc {name} does not exist and createIfNotExists is disabled")]
    ClaimMissing { name: String },
    #[error("failed to {op} {resource} {name}: {source}")]
    Store { resource: ResourceKind, op: StoreOp, name: String, #[source] source: StoreError },
    #[error("{}", join(.0))]
    Aggregate(Vec<Error>),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn store(resource: ResourceKind, op: StoreOp, name: impl Into<String>, source: StoreError) -> Self {
        Self::Store { resource, op, name: name.into(), source }
    }

    /// Combines errors so that none of them is lost. A single error is
    /// returned as is; nested aggregates are flattened.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Self> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Self::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Aggregate(flat)),
        }
    }

    /// Condition reason for this failure while converging `step`.
    pub fn reason(&self, step: ResourceKind) -> &'static str {
        match self {
            Self::Connection { .. } | Self::CredentialMissing => "DbConnectionDetailsFailed",
            Self::SecretNotFound { .. } | Self::KeyNotFound { .. } | Self::InvalidValue { .. } => "DbConnectionDetailsFailed",
            Self::AdminPasswordMissing { .. } => "OdooAdminPasswordFailed",
            Self::ClaimMissing { .. } => "PvcNotAvailable",
            Self::Store { resource, op, .. } => resource.reason(*op),
            Self::Aggregate(errors) => errors.first().map_or(step.reason(StoreOp::Create), |e| e.reason(step)),
            Self::Serialization(_) => step.reason(StoreOp::Create),
        }
    }

    /// Whether the failure happened while driving the init job.
    pub fn is_job_lifecycle(&self) -> bool {
        match self {
            Self::Store { resource, .. } => matches!(resource, ResourceKind::InitJob | ResourceKind::InitJobPod),
            Self::Aggregate(errors) => errors.iter().any(Self::is_job_lifecycle),
            _ => false,
        }
    }

    pub fn requeue_after(&self, config: &ReconcileConfig) -> Duration {
        if self.is_job_lifecycle() { config.requeue_job_poll } else { config.requeue_transient }
    }
}
