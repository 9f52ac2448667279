use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::Pod;
use odoo_operator::crd::{InitJobRecord, OdooDeploymentStatus};
use odoo_operator::init_job::InitJobTracker;
use odoo_operator::status::{ConditionStatus, StatusUpdate};
use odoo_operator::test_support::{sample_app, MemoryStore, Verb};
use odoo_operator::OdooDeployment;

const NS: &str = "erp";
const POLL: Duration = Duration::from_secs(30);

fn app_with_modules(modules: &[&str]) -> OdooDeployment {
    let mut app = sample_app("shop", NS);
    app.spec.modules = modules.iter().map(|m| m.to_string()).collect();
    app
}

fn job_pod(name: &str, job: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.into());
    pod.metadata.namespace = Some(NS.into());
    pod.metadata.labels = Some([("job-name".to_string(), job.to_string())].into());
    pod
}

fn set_job_status(store: &MemoryStore, status: JobStatus) {
    store.modify::<Job>(NS, "shop-init", |job| job.status = Some(status));
}

fn apply(status: &mut OdooDeploymentStatus, updates: Vec<StatusUpdate>) {
    for update in updates {
        update.apply(status);
    }
}

fn job_creates(store: &MemoryStore) -> usize {
    store.calls().iter().filter(|c| c.verb == Verb::Create && c.kind == "Job").count()
}

#[tokio::test]
async fn base_and_web_are_installed_in_one_job() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base", "web"]);
    let mut status = OdooDeploymentStatus::default();

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.requeue, Some(POLL));
    assert_eq!(
        outcome.updates,
        vec![StatusUpdate::InitJobStarted(InitJobRecord {
            name: "shop-init".into(),
            namespace: NS.into(),
            modules: vec!["base".into(), "web".into()],
        })]
    );
    let job: Job = store.object(NS, "shop-init").unwrap();
    let command = job.spec.unwrap().template.spec.unwrap().containers[0].command.clone().unwrap();
    assert_eq!(command.last().map(String::as_str), Some("base,web"));
    assert_eq!(job.metadata.owner_references.unwrap()[0].kind, "OdooDeployment");
    apply(&mut status, outcome.updates);

    set_job_status(&store, JobStatus { succeeded: Some(1), ..JobStatus::default() });
    store.insert(job_pod("shop-init-abcde", "shop-init"));
    store.insert(job_pod("shop-init-fghij", "shop-init"));
    store.insert(job_pod("other-pod", "other-job"));
    store.clear_calls();

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.updates, vec![StatusUpdate::InitJobSucceeded]);
    let condition = outcome.condition.clone().unwrap();
    assert_eq!((condition.status, condition.reason), (ConditionStatus::True, "InitJobSucceeded"));
    apply(&mut status, outcome.updates);

    assert_eq!(status.init_modules_installed, vec!["base".to_string(), "web".to_string()]);
    assert!(status.current_init_job.is_idle());
    assert_eq!(store.count::<Job>(NS), 0);
    assert!(store.object::<Pod>(NS, "other-pod").is_some());
    assert_eq!(store.count::<Pod>(NS), 1);
    let job_deletes = store.writes().iter().filter(|c| c.verb == Verb::Delete && c.kind == "Job").count();
    assert_eq!(job_deletes, 1);
    assert_eq!(job_creates(&store), 0);

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.updates.is_empty());
    assert_eq!(outcome.requeue, None);
}

#[tokio::test]
async fn running_job_is_never_duplicated() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let mut status = OdooDeploymentStatus::default();
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);
    set_job_status(&store, JobStatus { active: Some(1), ..JobStatus::default() });

    for _ in 0..3 {
        let outcome = tracker.track(&store, &app, &status).await;
        assert!(outcome.updates.is_empty());
        assert_eq!(outcome.requeue, Some(POLL));
        assert_eq!(outcome.condition.unwrap().reason, "InitJobRunning");
    }
    assert_eq!(job_creates(&store), 1);
    assert_eq!(store.count::<Job>(NS), 1);
}

#[tokio::test]
async fn pending_job_waits_like_running() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let mut status = OdooDeploymentStatus::default();
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.updates.is_empty());
    assert_eq!(outcome.requeue, Some(POLL));
    assert_eq!(job_creates(&store), 1);
}

#[tokio::test]
async fn vanished_job_is_recreated_in_the_same_pass() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let status = OdooDeploymentStatus {
        current_init_job: InitJobRecord { name: "shop-init".into(), namespace: NS.into(), modules: vec!["base".into()] },
        ..OdooDeploymentStatus::default()
    };

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.updates.len(), 2);
    assert_eq!(outcome.updates[0], StatusUpdate::InitJobCleared);
    assert!(matches!(outcome.updates[1], StatusUpdate::InitJobStarted(_)));
    assert!(store.object::<Job>(NS, "shop-init").is_some());
}

#[tokio::test]
async fn failed_job_is_reported_cleaned_up_and_retried() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let mut status = OdooDeploymentStatus::default();
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);
    set_job_status(&store, JobStatus { failed: Some(3), ..JobStatus::default() });
    store.insert(job_pod("shop-init-1", "shop-init"));

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.updates, vec![StatusUpdate::InitJobCleared]);
    let condition = outcome.condition.clone().unwrap();
    assert_eq!((condition.status, condition.reason), (ConditionStatus::False, "InitJobFailed"));
    assert_eq!(outcome.requeue, Some(POLL));
    assert_eq!(store.count::<Job>(NS), 0);
    assert_eq!(store.count::<Pod>(NS), 0);
    apply(&mut status, outcome.updates);
    assert!(status.init_modules_installed.is_empty());

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(matches!(outcome.updates.as_slice(), [StatusUpdate::InitJobStarted(_)]));
    assert_eq!(job_creates(&store), 2);
}

#[tokio::test]
async fn existing_job_is_adopted_on_conflict() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let (job, _) = odoo_operator::templates::init_job(&app);
    store.insert(job);

    let outcome = tracker.track(&store, &app, &OdooDeploymentStatus::default()).await;
    assert!(outcome.error.is_none());
    assert!(matches!(outcome.updates.as_slice(), [StatusUpdate::InitJobStarted(r)] if r.name == "shop-init"));
    assert_eq!(store.count::<Job>(NS), 1);
}

#[tokio::test]
async fn cleanup_failure_keeps_status_progress() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base"]);
    let mut status = OdooDeploymentStatus::default();
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);
    set_job_status(&store, JobStatus { succeeded: Some(1), ..JobStatus::default() });
    store.fail_on(Verb::List, "Pod");

    let outcome = tracker.track(&store, &app, &status).await;
    let err = outcome.error.expect("list failure surfaces");
    assert!(err.is_job_lifecycle());
    assert_eq!(err.reason(odoo_operator::error::ResourceKind::InitJob), "FailedToListPods");
    assert_eq!(outcome.updates, vec![StatusUpdate::InitJobSucceeded]);
    assert_eq!(store.count::<Job>(NS), 1);
}

#[tokio::test]
async fn matching_modules_need_no_job() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let app = app_with_modules(&["base", "web"]);
    let status = OdooDeploymentStatus {
        init_modules_installed: vec!["web".into(), "base".into()],
        ..OdooDeploymentStatus::default()
    };
    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.updates.is_empty());
    assert!(outcome.condition.is_none());
    assert_eq!(outcome.requeue, None);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn leftover_finished_job_is_replaced_not_adopted() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let mut app = app_with_modules(&["base"]);
    let mut status = OdooDeploymentStatus::default();
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);
    set_job_status(&store, JobStatus { succeeded: Some(1), ..JobStatus::default() });

    store.fail_on(Verb::Delete, "Job");
    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_some());
    apply(&mut status, outcome.updates);
    assert_eq!(status.init_modules_installed, vec!["base".to_string()]);
    assert_eq!(store.count::<Job>(NS), 1);
    store.heal();

    app.spec.modules = vec!["base".into(), "web".into()];
    let outcome = tracker.track(&store, &app, &status).await;
    assert!(outcome.error.is_none());
    assert!(outcome.updates.is_empty(), "{:?}", outcome.updates);
    assert_eq!(outcome.condition.unwrap().reason, "InitJobReplaced");
    assert_eq!(outcome.requeue, Some(POLL));
    assert_eq!(store.count::<Job>(NS), 0);

    let outcome = tracker.track(&store, &app, &status).await;
    assert!(matches!(outcome.updates.as_slice(), [StatusUpdate::InitJobStarted(r)] if r.modules == ["base", "web"]));
    apply(&mut status, outcome.updates);
    let job: Job = store.object(NS, "shop-init").unwrap();
    let command = job.spec.unwrap().template.spec.unwrap().containers[0].command.clone().unwrap();
    assert_eq!(command.last().map(String::as_str), Some("base,web"));
    assert_eq!(status.init_modules_installed, vec!["base".to_string()]);

    set_job_status(&store, JobStatus { succeeded: Some(1), ..JobStatus::default() });
    let updates = tracker.track(&store, &app, &status).await.updates;
    apply(&mut status, updates);
    assert_eq!(status.init_modules_installed, vec!["base".to_string(), "web".to_string()]);
}

#[tokio::test]
async fn running_job_for_other_modules_is_replaced() {
    let store = MemoryStore::new();
    let tracker = InitJobTracker::new(POLL);
    let (job, _) = odoo_operator::templates::init_job(&app_with_modules(&["sale"]));
    store.insert(job);
    set_job_status(&store, JobStatus { active: Some(1), ..JobStatus::default() });
    store.insert(job_pod("shop-init-x", "shop-init"));

    let app = app_with_modules(&["base", "web"]);
    let outcome = tracker.track(&store, &app, &OdooDeploymentStatus::default()).await;
    assert!(outcome.updates.is_empty());
    assert_eq!(store.count::<Job>(NS), 0);
    assert_eq!(store.count::<Pod>(NS), 0);
}
