//! Resolution of literal-or-secret-reference values.
use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::crd::{OdooDeployment, SecretKeyRef, ADMIN_PASSWORD_KEY};
use crate::error::{ConnectionField, Error, ResourceKind, Result, StoreOp};
use crate::store::ResourceStore;

/// Database connection details, resolved fresh on every pass and never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: i32,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl: bool,
    pub max_conn: i32,
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("ssl", &self.ssl)
            .field("max_conn", &self.max_conn)
            .finish()
    }
}

/// Conversion from the raw string stored in a secret.
pub trait SecretValue: Sized {
    const EXPECTED: &'static str;
    fn parse_secret(raw: &str) -> Option<Self>;
}

impl SecretValue for String {
    const EXPECTED: &'static str = "string";
    fn parse_secret(raw: &str) -> Option<Self> { Some(raw.to_string()) }
}

impl SecretValue for i32 {
    const EXPECTED: &'static str = "32-bit integer";
    fn parse_secret(raw: &str) -> Option<Self> { raw.trim().parse().ok() }
}

impl SecretValue for bool {
    const EXPECTED: &'static str = "boolean";
    fn parse_secret(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
            _ => None,
        }
    }
}

/// Reads `reference.name/reference.key` and returns the raw value.
pub async fn secret_value<S: ResourceStore>(store: &S, namespace: &str, reference: &SecretKeyRef) -> Result<String> {
    let secret = store
        .get::<Secret>(namespace, &reference.name)
        .await
        .map_err(|e| Error::store(ResourceKind::ReferencedSecret, StoreOp::Get, &reference.name, e))?
        .ok_or_else(|| Error::SecretNotFound { name: reference.name.clone() })?;
    let key_missing = || Error::KeyNotFound { name: reference.name.clone(), key: reference.key.clone() };
    let bytes = secret.data.as_ref().and_then(|d| d.get(&reference.key)).map(|b| b.0.clone());
    let bytes = match bytes {
        Some(bytes) => bytes,
        None => secret.string_data.as_ref().and_then(|d| d.get(&reference.key)).map(|s| s.clone().into_bytes()).ok_or_else(key_missing)?,
    };
    String::from_utf8(bytes).map_err(|_| Error::InvalidValue {
        name: reference.name.clone(),
        key: reference.key.clone(),
        expected: "UTF-8 string",
    })
}

/// Returns `literal` when no reference is configured, otherwise the
/// referenced value converted to `T`.
pub async fn resolve<S: ResourceStore, T: SecretValue>(
    store: &S,
    namespace: &str,
    literal: T,
    reference: Option<&SecretKeyRef>,
) -> Result<T> {
    let Some(reference) = reference.filter(|r| r.is_set()) else { return Ok(literal) };
    let raw = secret_value(store, namespace, reference).await?;
    T::parse_secret(&raw).ok_or_else(|| Error::InvalidValue {
        name: reference.name.clone(),
        key: reference.key.clone(),
        expected: T::EXPECTED,
    })
}

/// The password has no implicit default: a reference or an explicit literal is required.
async fn resolve_password<S: ResourceStore>(store: &S, namespace: &str, app: &OdooDeployment) -> Result<String> {
    let db = &app.spec.database;
    match (db.password_from_secret.as_ref().filter(|r| r.is_set()), db.password.as_deref()) {
        (Some(reference), _) => secret_value(store, namespace, reference).await,
        (None, Some(literal)) if !literal.is_empty() => Ok(literal.to_string()),
        _ => Err(Error::CredentialMissing),
    }
}

fn field(field: ConnectionField) -> impl FnOnce(Error) -> Error {
    move |source| Error::Connection { field, source: Box::new(source) }
}

/// Resolves every connection field in a fixed order. The first failure aborts
/// the whole descriptor.
pub async fn resolve_connection<S: ResourceStore>(store: &S, app: &OdooDeployment) -> Result<ConnectionDescriptor> {
    let ns = app.namespace_or_default();
    let db = &app.spec.database;
    let host = resolve(store, &ns, db.host.clone(), db.host_from_secret.as_ref()).await.map_err(field(ConnectionField::Host))?;
    let port = resolve(store, &ns, db.port, db.port_from_secret.as_ref()).await.map_err(field(ConnectionField::Port))?;
    let user = resolve(store, &ns, db.user.clone(), db.user_from_secret.as_ref()).await.map_err(field(ConnectionField::User))?;
    let password = resolve_password(store, &ns, app).await.map_err(field(ConnectionField::Password))?;
    let name = resolve(store, &ns, db.name.clone(), db.name_from_secret.as_ref()).await.map_err(field(ConnectionField::Name))?;
    let ssl = resolve(store, &ns, db.ssl, db.ssl_from_secret.as_ref()).await.map_err(field(ConnectionField::Ssl))?;
    let max_conn = resolve(store, &ns, db.max_conn, db.max_conn_from_secret.as_ref()).await.map_err(field(ConnectionField::MaxConn))?;
    debug!(host = %host, port, database = %name, ssl, "db.connection.resolved");
    Ok(ConnectionDescriptor { host, port, user, password, name, ssl, max_conn })
}

/// Reads the admin password out of the converged credentials secret.
pub fn admin_password(secret: &Secret) -> Result<String> {
    let missing = || Error::AdminPasswordMissing { secret: secret.metadata.name.clone().unwrap_or_default(), key: ADMIN_PASSWORD_KEY };
    let bytes = secret.data.as_ref().and_then(|d| d.get(ADMIN_PASSWORD_KEY)).ok_or_else(missing)?;
    String::from_utf8(bytes.0.clone()).map_err(|_| missing())
}
