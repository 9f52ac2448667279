use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::crd::OdooDeployment;

/// Namespaced objects the operator can read and write through a store.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Managed for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Failures talking to the object store. "Not found" is not one of them: reads
/// return `None` and deletes of missing objects succeed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
            other => StoreError::Request(other.to_string()),
        }
    }
}

/// Generic namespaced key/value object store with optimistic concurrency on
/// `metadata.resourceVersion`. Callers supply cancellation by dropping the
/// future.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;
    /// Full replacement; a stale resourceVersion fails with `Conflict`.
    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    /// `selector` uses the `key=value[,key=value]` label selector syntax.
    async fn list<K: Managed>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, StoreError>;
    async fn replace_status(&self, app: &OdooDeployment) -> Result<OdooDeployment, StoreError>;
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore { client: Client }

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        Ok(self.api::<K>(namespace).create(&PostParams::default(), obj).await?)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        Ok(self.api::<K>(namespace).replace(&name, &PostParams::default(), obj).await?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = %K::kind(&()), namespace, name, "delete.already_gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list<K: Managed>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn replace_status(&self, app: &OdooDeployment) -> Result<OdooDeployment, StoreError> {
        let namespace = app.namespace_or_default();
        let body = serde_json::to_vec(app).map_err(|e| StoreError::Request(e.to_string()))?;
        let api: Api<OdooDeployment> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace_status(&app.name_any(), &PostParams::default(), body).await?)
    }
}

/// Parses a `key=value[,key=value]` selector into pairs. Blank segments are ignored.
pub fn parse_selector(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() { return None; }
            part.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        assert_eq!(parse_selector("job-name=shop-init"), vec![("job-name", "shop-init")]);
        assert_eq!(parse_selector("a=1, b=2,"), vec![("a", "1"), ("b", "2")]);
        assert!(parse_selector("").is_empty());
    }

    #[test]
    fn conflicts_are_distinguished() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(matches!(StoreError::from(conflict), StoreError::Conflict(_)));
        let timeout = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "timeout".into(),
            reason: "Timeout".into(),
            code: 504,
        });
        assert!(matches!(StoreError::from(timeout), StoreError::Request(_)));
    }
}
