pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod init_job;
pub mod logging;
pub mod reconciler;
pub mod render;
pub mod resolver;
pub mod status;
pub mod steps;
pub mod store;
pub mod templates;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// Re-export commonly used symbols for convenience in binaries/tests.
pub use crd::{OdooDeployment, OdooDeploymentSpec, OdooDeploymentStatus};
pub use error::{Error, Result};
pub use reconciler::Reconciler;
pub use store::{KubeStore, ResourceStore};
