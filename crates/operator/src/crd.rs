use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key under which the credentials secret stores the admin password.
pub const ADMIN_PASSWORD_KEY: &str = "password";
/// Key under which the config secret stores the rendered configuration.
pub const CONFIG_FILE_KEY: &str = "odoo.conf";
pub const HTTP_PORT: i32 = 8069;
pub const POLL_PORT: i32 = 8072;

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[kube(
    group = "odoo.abugharbia.com",
    version = "v1",
    kind = "OdooDeployment",
    shortname = "odoo",
    namespaced,
    status = "OdooDeploymentStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OdooDeploymentSpec {
    /// Display name. Dependent object names derive from `metadata.name`.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub config: OdooConfig,
    /// Modules the database is initialised with.
    #[serde(default = "default_modules")]
    #[schemars(length(min = 1))]
    pub modules: Vec<String>,
    #[serde(default)]
    pub odoo_filestore: FilestoreSpec,
}

/// Points at one key of a Secret in the App Deployment's namespace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl SecretKeyRef {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self { name: name.into(), key: key.into() }
    }

    /// A reference only counts when both halves are filled in.
    pub fn is_set(&self) -> bool {
        !self.name.is_empty() && !self.key.is_empty()
    }
}

/// Database connection settings. Every field is a literal with an optional
/// `*FromSecret` override.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_from_secret: Option<SecretKeyRef>,
    #[serde(default = "default_db_port")]
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_from_secret: Option<SecretKeyRef>,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_from_secret: Option<SecretKeyRef>,
    /// Plain-text password. Prefer `passwordFromSecret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_from_secret: Option<SecretKeyRef>,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_from_secret: Option<SecretKeyRef>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_from_secret: Option<SecretKeyRef>,
    #[serde(default = "default_db_max_conn")]
    pub max_conn: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conn_from_secret: Option<SecretKeyRef>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            host_from_secret: None,
            port: default_db_port(),
            port_from_secret: None,
            user: default_db_user(),
            user_from_secret: None,
            password: None,
            password_from_secret: None,
            name: default_db_name(),
            name_from_secret: None,
            ssl: false,
            ssl_from_secret: None,
            max_conn: default_db_max_conn(),
            max_conn_from_secret: None,
        }
    }
}

impl DatabaseConfig {
    /// Every configured secret reference, in resolution order.
    pub fn secret_refs(&self) -> impl Iterator<Item = &SecretKeyRef> {
        [
            &self.host_from_secret,
            &self.port_from_secret,
            &self.user_from_secret,
            &self.password_from_secret,
            &self.name_from_secret,
            &self.ssl_from_secret,
            &self.max_conn_from_secret,
        ]
        .into_iter()
        .flatten()
        .filter(|r| r.is_set())
    }
}

/// Runtime settings rendered into `odoo.conf`.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OdooConfig {
    /// Secret holding the admin (database manager) password. Generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret_name: Option<String>,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub without_demo: bool,
    #[serde(default = "default_true")]
    pub proxy_mode: bool,
    #[serde(default = "default_workers")]
    pub workers: i32,
    #[serde(default = "default_limit_request")]
    pub limit_request: i32,
    #[serde(default = "default_limit_time_real")]
    pub limit_time_real: i32,
    #[serde(default = "default_limit_time_cpu")]
    pub limit_time_cpu: i32,
    #[serde(default = "default_limit_memory_soft")]
    pub limit_memory_soft: i64,
    #[serde(default = "default_limit_memory_hard")]
    pub limit_memory_hard: i64,
}

impl Default for OdooConfig {
    fn default() -> Self {
        Self {
            admin_password_secret_name: None,
            debug_mode: false,
            data_dir: default_data_dir(),
            without_demo: true,
            proxy_mode: true,
            workers: default_workers(),
            limit_request: default_limit_request(),
            limit_time_real: default_limit_time_real(),
            limit_time_cpu: default_limit_time_cpu(),
            limit_memory_soft: default_limit_memory_soft(),
            limit_memory_hard: default_limit_memory_hard(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilestoreSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub create_if_not_exists: bool,
    #[serde(default = "default_filestore_size")]
    pub size: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

impl Default for FilestoreSpec {
    fn default() -> Self {
        Self {
            name: None,
            create_if_not_exists: true,
            size: default_filestore_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
        }
    }
}

/// The init job currently in flight. An empty name means idle.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct InitJobRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "jobNamespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

impl InitJobRecord {
    pub fn is_idle(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OdooDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odoo_config_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odoo_data_pvc_name: Option<String>,
    #[serde(default)]
    pub init_modules_installed: Vec<String>,
    #[serde(default)]
    pub current_init_job: InitJobRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odoo_admin_secret_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl OdooDeployment {
    pub fn instance_name(&self) -> String {
        self.name_any()
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn admin_secret_name(&self) -> String {
        match self.user_admin_secret_name() {
            Some(name) => name.to_string(),
            None => format!("{}-admin-password", self.instance_name()),
        }
    }

    /// The admin secret name the user asked for, if any.
    pub fn user_admin_secret_name(&self) -> Option<&str> {
        self.spec.config.admin_password_secret_name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn config_secret_name(&self) -> String {
        format!("{}-config", self.instance_name())
    }

    pub fn filestore_claim_name(&self) -> String {
        match self.spec.odoo_filestore.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{}-filestore", self.instance_name()),
        }
    }

    pub fn workload_name(&self) -> String {
        self.instance_name()
    }

    pub fn init_job_name(&self) -> String {
        format!("{}-init", self.instance_name())
    }

    pub fn http_service_name(&self) -> String {
        format!("{}-http", self.instance_name())
    }

    pub fn poll_service_name(&self) -> String {
        format!("{}-poll", self.instance_name())
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.instance_name())])
    }

    /// Whether the named secret feeds this deployment's configuration, either
    /// through a database reference or as the admin password secret.
    pub fn uses_secret(&self, secret: &str) -> bool {
        self.spec.database.secret_refs().any(|r| r.name == secret)
            || self.user_admin_secret_name() == Some(secret)
    }
}

fn default_replicas() -> i32 {
    1
}
fn default_image() -> String {
    "odoo:18".into()
}
fn default_pull_policy() -> String {
    "IfNotPresent".into()
}
fn default_modules() -> Vec<String> {
    vec!["base".into()]
}
fn default_db_host() -> String {
    "postgresql".into()
}
fn default_db_port() -> i32 {
    5432
}
fn default_db_user() -> String {
    "odoo".into()
}
fn default_db_name() -> String {
    "odoo".into()
}
fn default_db_max_conn() -> i32 {
    20
}
fn default_data_dir() -> String {
    "/var/lib/odoo".into()
}
fn default_true() -> bool {
    true
}
fn default_workers() -> i32 {
    2
}
fn default_limit_request() -> i32 {
    8192
}
fn default_limit_time_real() -> i32 {
    120
}
fn default_limit_time_cpu() -> i32 {
    60
}
fn default_limit_memory_soft() -> i64 {
    2_147_483_648
}
fn default_limit_memory_hard() -> i64 {
    2_684_354_560
}
fn default_filestore_size() -> Quantity {
    Quantity("10Gi".into())
}
fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(spec: serde_json::Value) -> OdooDeployment {
        let mut app = OdooDeployment::new("shop", serde_json::from_value(spec).unwrap());
        app.metadata.namespace = Some("erp".into());
        app
    }

    #[test]
    fn empty_spec_takes_documented_defaults() {
        let app = app(serde_json::json!({}));
        assert_eq!(app.spec.replicas, 1);
        assert_eq!(app.spec.image, "odoo:18");
        assert_eq!(app.spec.modules, vec!["base".to_string()]);
        assert_eq!(app.spec.database.port, 5432);
        assert_eq!(app.spec.config.limit_memory_hard, 2_684_354_560);
        assert!(app.spec.config.without_demo);
        assert_eq!(app.spec.odoo_filestore.access_modes, vec!["ReadWriteOnce".to_string()]);
    }

    #[test]
    fn derived_names() {
        let app = app(serde_json::json!({}));
        assert_eq!(app.config_secret_name(), "shop-config");
        assert_eq!(app.admin_secret_name(), "shop-admin-password");
        assert_eq!(app.init_job_name(), "shop-init");
        assert_eq!(app.http_service_name(), "shop-http");
        assert_eq!(app.poll_service_name(), "shop-poll");
        assert_eq!(app.filestore_claim_name(), "shop-filestore");
    }

    #[test]
    fn user_supplied_names_win() {
        let app = app(serde_json::json!({
            "config": {"adminPasswordSecretName": "root-pw"},
            "odooFilestore": {"name": "shared-data"}
        }));
        assert_eq!(app.admin_secret_name(), "root-pw");
        assert_eq!(app.filestore_claim_name(), "shared-data");
    }

    #[test]
    fn uses_secret_checks_every_reference() {
        let app = app(serde_json::json!({
            "database": {
                "hostFromSecret": {"name": "h", "key": "host"},
                "maxConnFromSecret": {"name": "m", "key": "max"},
                "passwordFromSecret": {"name": "", "key": "password"}
            },
            "config": {"adminPasswordSecretName": "root-pw"}
        }));
        assert!(app.uses_secret("h"));
        assert!(app.uses_secret("m"));
        assert!(app.uses_secret("root-pw"));
        assert!(!app.uses_secret(""));
        assert!(!app.uses_secret("other"));
    }

    #[test]
    fn status_round_trips_job_namespace_field() {
        let status: OdooDeploymentStatus = serde_json::from_value(serde_json::json!({
            "initModulesInstalled": [],
            "currentInitJob": {"name": "shop-init", "jobNamespace": "erp", "modules": ["base"]},
            "conditions": []
        }))
        .unwrap();
        assert_eq!(status.current_init_job.namespace, "erp");
        assert!(!status.current_init_job.is_idle());
        let back = serde_json::to_value(&status).unwrap();
        assert_eq!(back["currentInitJob"]["jobNamespace"], "erp");
    }
}
