//! Desired shapes of the dependent objects.
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use rand::distributions::{Alphanumeric, DistString};

use crate::crd::{OdooDeployment, ADMIN_PASSWORD_KEY, CONFIG_FILE_KEY, HTTP_PORT, POLL_PORT};

const ADMIN_PASSWORD_LEN: usize = 32;
const CONFIG_MOUNT: &str = "/opt/odoo";
const DATA_VOLUME: &str = "odoo-data";
const CONFIG_VOLUME: &str = "config";

fn meta(app: &OdooDeployment, name: String) -> ObjectMeta {
    ObjectMeta { name: Some(name), namespace: Some(app.namespace_or_default()), ..ObjectMeta::default() }
}

pub fn generate_password() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), ADMIN_PASSWORD_LEN)
}

/// Credentials secret carrying a freshly generated admin password.
pub fn admin_secret(app: &OdooDeployment) -> Secret {
    Secret {
        metadata: meta(app, app.admin_secret_name()),
        data: Some(BTreeMap::from([(ADMIN_PASSWORD_KEY.to_string(), ByteString(generate_password().into_bytes()))])),
        ..Secret::default()
    }
}

pub fn config_secret(app: &OdooDeployment, rendered: String) -> Secret {
    Secret {
        metadata: meta(app, app.config_secret_name()),
        data: Some(BTreeMap::from([(CONFIG_FILE_KEY.to_string(), ByteString(rendered.into_bytes()))])),
        ..Secret::default()
    }
}

pub fn filestore_claim(app: &OdooDeployment) -> PersistentVolumeClaim {
    let fs = &app.spec.odoo_filestore;
    PersistentVolumeClaim {
        metadata: meta(app, app.filestore_claim_name()),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(fs.access_modes.clone()),
            storage_class_name: fs.storage_class_name.clone().filter(|s| !s.is_empty()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), fs.size.clone())])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort { name: Some(name.into()), container_port: port, protocol: Some("TCP".into()), ..ContainerPort::default() }
}

fn data_mount(data_dir: &str, sub_path: &str) -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.into(),
        mount_path: format!("{}/{sub_path}", data_dir.trim_end_matches('/')),
        sub_path: Some(sub_path.into()),
        read_only: Some(false),
        ..VolumeMount::default()
    }
}

/// Pod spec shared by the workload and the init job.
pub fn pod_spec(app: &OdooDeployment) -> PodSpec {
    let data_dir = &app.spec.config.data_dir;
    PodSpec {
        containers: vec![Container {
            name: "odoo".into(),
            image: Some(app.spec.image.clone()),
            image_pull_policy: Some(app.spec.image_pull_policy.clone()),
            command: Some(base_command()),
            ports: Some(vec![container_port("http", HTTP_PORT), container_port("poll", POLL_PORT)]),
            volume_mounts: Some(vec![
                data_mount(data_dir, "filestore"),
                data_mount(data_dir, "sessions"),
                VolumeMount { name: CONFIG_VOLUME.into(), mount_path: CONFIG_MOUNT.into(), read_only: Some(true), ..VolumeMount::default() },
            ]),
            termination_message_path: Some("/dev/termination-log".into()),
            termination_message_policy: Some("File".into()),
            ..Container::default()
        }],
        volumes: Some(vec![
            Volume {
                name: DATA_VOLUME.into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: app.filestore_claim_name(),
                    ..PersistentVolumeClaimVolumeSource::default()
                }),
                ..Volume::default()
            },
            Volume {
                name: CONFIG_VOLUME.into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(app.config_secret_name()),
                    items: Some(vec![KeyToPath { key: CONFIG_FILE_KEY.into(), path: CONFIG_FILE_KEY.into(), mode: None }]),
                    default_mode: Some(0o444),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
        ]),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(100),
            run_as_group: Some(101),
            run_as_non_root: Some(true),
            fs_group: Some(101),
            ..PodSecurityContext::default()
        }),
        restart_policy: Some("Always".into()),
        dns_policy: Some("ClusterFirst".into()),
        termination_grace_period_seconds: Some(30),
        scheduler_name: Some("default-scheduler".into()),
        ..PodSpec::default()
    }
}

fn base_command() -> Vec<String> {
    vec!["/entrypoint.sh".into(), "-c".into(), format!("{CONFIG_MOUNT}/{CONFIG_FILE_KEY}")]
}

pub fn workload(app: &OdooDeployment) -> Deployment {
    let labels = app.selector_labels();
    let quarter = || Some(IntOrString::String("25%".into()));
    Deployment {
        metadata: meta(app, app.workload_name()),
        spec: Some(DeploymentSpec {
            replicas: Some(app.spec.replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..LabelSelector::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..ObjectMeta::default() }),
                spec: Some(pod_spec(app)),
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateDeployment { max_surge: quarter(), max_unavailable: quarter() }),
            }),
            revision_history_limit: Some(10),
            progress_deadline_seconds: Some(600),
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// One-shot job that initialises the database with the requested modules.
/// Returns the job together with the module list it installs.
pub fn init_job(app: &OdooDeployment) -> (Job, Vec<String>) {
    let modules = app.spec.modules.clone();
    let mut spec = pod_spec(app);
    if let Some(container) = spec.containers.first_mut() {
        let mut command = base_command();
        command.extend(["--stop-after-init".into(), "--no-http".into(), "--init".into(), modules.join(",")]);
        container.command = Some(command);
        container.ports = None;
    }
    spec.restart_policy = Some("Never".into());
    let job = Job {
        metadata: meta(app, app.init_job_name()),
        spec: Some(JobSpec {
            template: PodTemplateSpec { metadata: None, spec: Some(spec) },
            parallelism: Some(1),
            backoff_limit: Some(2),
            ..JobSpec::default()
        }),
        ..Job::default()
    };
    (job, modules)
}

fn service(app: &OdooDeployment, name: String, port: i32) -> Service {
    Service {
        metadata: meta(app, name),
        spec: Some(ServiceSpec {
            selector: Some(app.selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".into()),
                ..ServicePort::default()
            }]),
            type_: Some("ClusterIP".into()),
            session_affinity: Some("None".into()),
            internal_traffic_policy: Some("Cluster".into()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn http_service(app: &OdooDeployment) -> Service {
    service(app, app.http_service_name(), HTTP_PORT)
}

pub fn poll_service(app: &OdooDeployment) -> Service {
    service(app, app.poll_service_name(), POLL_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_app;

    #[test]
    fn init_job_command_and_shape() {
        let mut app = sample_app("shop", "erp");
        app.spec.modules = vec!["base".into(), "web".into()];
        let (job, modules) = init_job(&app);
        assert_eq!(modules, vec!["base".to_string(), "web".to_string()]);
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(2));
        assert_eq!(spec.parallelism, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(
            container.command.as_deref().unwrap(),
            ["/entrypoint.sh", "-c", "/opt/odoo/odoo.conf", "--stop-after-init", "--no-http", "--init", "base,web"]
        );
        assert!(container.ports.is_none());
        assert_eq!(job.metadata.name.as_deref(), Some("shop-init"));
    }

    #[test]
    fn workload_mounts_filestore_and_config() {
        let app = sample_app("shop", "erp");
        let deploy = workload(&app);
        let spec = deploy.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        let paths: Vec<_> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(paths, ["/var/lib/odoo/filestore", "/var/lib/odoo/sessions", "/opt/odoo"]);
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name, "shop-filestore");
        let secret = volumes[1].secret.as_ref().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("shop-config"));
        assert_eq!(secret.default_mode, Some(0o444));
        assert_eq!(pod.security_context.unwrap().run_as_user, Some(100));
    }

    #[test]
    fn services_target_their_ports() {
        let app = sample_app("shop", "erp");
        let http = http_service(&app).spec.unwrap();
        let poll = poll_service(&app).spec.unwrap();
        assert_eq!(http.ports.unwrap()[0].port, 8069);
        assert_eq!(poll.ports.unwrap()[0].target_port, Some(IntOrString::Int(8072)));
        assert_eq!(http.selector.unwrap().get("app").map(String::as_str), Some("shop"));
    }

    #[test]
    fn generated_passwords_are_distinct() {
        let a = generate_password();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_password());
    }

    #[test]
    fn claim_requests_configured_size() {
        let mut app = sample_app("shop", "erp");
        app.spec.odoo_filestore.storage_class_name = Some("fast".into());
        let claim = filestore_claim(&app);
        let spec = claim.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(spec.resources.unwrap().requests.unwrap()["storage"].0, "10Gi");
    }
}
