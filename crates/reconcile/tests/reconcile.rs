#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use imirror_core::{ContainerSpec, MirrorRoot, Workload, WorkloadIdentity, WorkloadKind};
use imirror_reconcile::config::DEFAULT_MIRROR_ROOT;
use imirror_reconcile::mock::{MockImageStore, MockWorkloadStore, StaticCredentials};
use imirror_reconcile::{Config, InFlightTracker, Mirror, Outcome, ReconcileError, Reconciler};

struct Env {
    workloads: Arc<MockWorkloadStore>,
    images: Arc<MockImageStore>,
    reconciler: Reconciler,
}

fn env_with_root(root: &str) -> Env {
    let root = MirrorRoot::parse(root).unwrap();
    let workloads = Arc::new(MockWorkloadStore::new());
    let images = Arc::new(MockImageStore::new());
    let mirror = Arc::new(Mirror::new(root.clone(), images.clone(), Arc::new(StaticCredentials::basic("bot", "pw"))));
    let reconciler = Reconciler::new(Arc::new(Config::new(root)), workloads.clone(), mirror, Arc::new(InFlightTracker::new()));
    Env { workloads, images, reconciler }
}

fn env() -> Env {
    env_with_root("mirror.local")
}

fn id(ns: &str, name: &str) -> WorkloadIdentity {
    WorkloadIdentity::new(WorkloadKind::Deployment, ns, name)
}

fn shop_web() -> Workload {
    let mut w = Workload::new(id("shop", "web"));
    w.init_containers = vec![ContainerSpec::new("migrate", "ghcr.io/shop/migrate:3")];
    w.containers = vec![
        ContainerSpec::new("web", "nginx:1.25"),
        ContainerSpec::new("cache", "mirror.local/index_docker_io_library_redis:7"),
    ];
    w
}

fn images_of(w: &Workload) -> Vec<&str> {
    w.init_containers.iter().chain(w.containers.iter()).map(|c| c.image.as_str()).collect()
}

#[tokio::test]
async fn excluded_namespace_is_never_fetched() {
    let e = env();
    let mut w = shop_web();
    w.identity = id("kube-system", "coredns");
    e.workloads.insert(w);

    let out = e.reconciler.reconcile(&id("kube-system", "coredns")).await.unwrap();
    assert_eq!(out, Outcome::Excluded);
    assert_eq!(e.workloads.gets(), 0);
    assert!(e.workloads.updates().is_empty());
}

#[tokio::test]
async fn missing_workload_is_a_quiet_no_op() {
    let e = env();
    let out = e.reconciler.reconcile(&id("shop", "gone")).await.unwrap();
    assert_eq!(out, Outcome::NotFound);
    assert!(e.images.pulls().is_empty());
}

#[tokio::test]
async fn rewrites_unmirrored_containers_and_arms_rollback() {
    let e = env();
    e.workloads.insert(shop_web());

    let out = e.reconciler.reconcile(&id("shop", "web")).await.unwrap();
    assert_eq!(out, Outcome::Updated);

    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert_eq!(
        images_of(&stored),
        vec![
            "mirror.local/ghcr_io_shop_migrate:3",
            "mirror.local/index_docker_io_library_nginx:1.25",
            "mirror.local/index_docker_io_library_redis:7",
        ]
    );
    assert_eq!(e.images.pushes().len(), 2);
    assert_eq!(e.workloads.updates().len(), 1);
    assert!(e.reconciler.tracker().is_armed(&id("shop", "web")));

    // second pass sees only mirrored images
    let out = e.reconciler.reconcile(&id("shop", "web")).await.unwrap();
    assert_eq!(out, Outcome::Unchanged);
    assert_eq!(e.images.pushes().len(), 2);
    assert_eq!(e.workloads.updates().len(), 1);
}

#[tokio::test]
async fn default_root_maps_under_its_repository() {
    let e = env_with_root(DEFAULT_MIRROR_ROOT);
    let mut w = Workload::new(id("shop", "web"));
    w.containers = vec![ContainerSpec::new("web", "nginx:1.25")];
    e.workloads.insert(w);

    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);
    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert_eq!(stored.containers[0].image, "index.docker.io/skhlimr/index_docker_io_library_nginx:1.25");
}

#[tokio::test]
async fn failed_mirrors_leave_workload_untouched() {
    let e = env();
    let mut w = Workload::new(id("shop", "web"));
    w.containers = vec![ContainerSpec::new("web", "nginx:1.25")];
    e.workloads.insert(w);
    e.images.fail_pull("index.docker.io/library/nginx:1.25");

    let out = e.reconciler.reconcile(&id("shop", "web")).await.unwrap();
    assert_eq!(out, Outcome::Unchanged);
    assert!(e.workloads.updates().is_empty());
    assert!(!e.reconciler.tracker().is_armed(&id("shop", "web")));
}

#[tokio::test]
async fn write_conflict_refetches_and_retries() {
    let e = env();
    e.workloads.insert(shop_web());
    e.workloads.conflict_next_updates(1);

    let out = e.reconciler.reconcile(&id("shop", "web")).await.unwrap();
    assert_eq!(out, Outcome::Updated);
    assert_eq!(e.workloads.gets(), 2);
    assert_eq!(e.workloads.updates().len(), 1);
}

#[tokio::test]
async fn persistent_conflicts_give_up() {
    let e = env();
    e.workloads.insert(shop_web());
    e.workloads.conflict_next_updates(100);

    let err = e.reconciler.reconcile(&id("shop", "web")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::WriteConflict { attempts: 4, .. }), "{err}");
    assert!(e.workloads.updates().is_empty());
    assert!(!e.reconciler.tracker().is_armed(&id("shop", "web")));
}

#[tokio::test]
async fn fetch_failure_surfaces() {
    let e = env();
    e.workloads.insert(shop_web());
    e.workloads.fail_next_gets(1);

    let err = e.reconciler.reconcile(&id("shop", "web")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Fetch { .. }));
    assert!(e.images.pulls().is_empty());
}

#[tokio::test]
async fn skip_annotation_opts_out() {
    let e = env();
    let mut w = shop_web();
    w.skip = true;
    e.workloads.insert(w);

    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Skipped);
    assert!(e.images.pulls().is_empty());
    assert!(e.workloads.updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ready_while_in_flight_disarms_rollback() {
    let e = env();
    e.workloads.insert(shop_web());
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);

    tokio::time::sleep(Duration::from_secs(30)).await;
    e.workloads.set_ready(&id("shop", "web"), true);
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Stabilized);
    assert!(!e.reconciler.tracker().is_armed(&id("shop", "web")));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert!(!stored.rolled_back);
    assert_eq!(stored.containers[0].image, "mirror.local/index_docker_io_library_nginx:1.25");
    assert_eq!(e.workloads.updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_restores_original_images() {
    let e = env();
    e.workloads.insert(shop_web());
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(!e.workloads.workload(&id("shop", "web")).unwrap().rolled_back);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert!(stored.rolled_back);
    assert_eq!(
        images_of(&stored),
        vec!["ghcr.io/shop/migrate:3", "nginx:1.25", "mirror.local/index_docker_io_library_redis:7"]
    );
    assert!(!e.reconciler.tracker().is_armed(&id("shop", "web")));

    // the restored images are not mirrored again
    let pushes = e.images.pushes().len();
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Skipped);
    assert_eq!(e.images.pushes().len(), pushes);
}

#[tokio::test(start_paused = true)]
async fn rollback_keeps_images_changed_by_others() {
    let e = env();
    e.workloads.insert(shop_web());
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);

    e.workloads.set_image(&id("shop", "web"), "web", "nginx:1.27");
    tokio::time::sleep(Duration::from_secs(301)).await;

    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert!(stored.rolled_back);
    assert_eq!(stored.init_containers[0].image, "ghcr.io/shop/migrate:3");
    assert_eq!(stored.containers[0].image, "nginx:1.27");
}

#[tokio::test(start_paused = true)]
async fn rollback_of_deleted_workload_is_dropped() {
    let e = env();
    e.workloads.insert(shop_web());
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);

    e.workloads.remove(&id("shop", "web"));
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(e.workloads.workload(&id("shop", "web")).is_none());
    assert_eq!(e.workloads.updates().len(), 1);
    assert!(e.reconciler.tracker().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rollback_after_second_rewrite_restores_both() {
    let e = env();
    let mut w = Workload::new(id("shop", "web"));
    w.containers = vec![ContainerSpec::new("a", "nginx:1.25"), ContainerSpec::new("b", "ghcr.io/org/b:1")];
    e.workloads.insert(w);
    e.images.fail_pull("ghcr.io/org/b:1");

    // first pass mirrors only `a`
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // `b` moves on and the second pass mirrors it, re-arming the timer
    e.workloads.set_image(&id("shop", "web"), "b", "ghcr.io/org/b:2");
    assert_eq!(e.reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Updated);
    assert_eq!(
        images_of(&e.workloads.workload(&id("shop", "web")).unwrap()),
        vec!["mirror.local/index_docker_io_library_nginx:1.25", "mirror.local/ghcr_io_org_b:2"]
    );

    tokio::time::sleep(Duration::from_secs(301)).await;
    let stored = e.workloads.workload(&id("shop", "web")).unwrap();
    assert!(stored.rolled_back);
    assert_eq!(images_of(&stored), vec!["nginx:1.25", "ghcr.io/org/b:2"]);
}
