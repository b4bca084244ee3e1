#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use imirror_core::{ContainerSpec, MirrorRoot, Workload, WorkloadIdentity, WorkloadKind};
use imirror_reconcile::mock::{MockImageStore, MockWorkloadStore, StaticCredentials};
use imirror_reconcile::{Config, InFlightTracker, Mirror, Outcome, Reconciler};
use metrics::{Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Recorder, SharedString, Unit};

struct Samples(Arc<AtomicUsize>);

impl HistogramFn for Samples {
    fn record(&self, _value: f64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts `reconcile_latency_ms` samples; everything else is dropped.
struct LatencyRecorder {
    samples: Arc<AtomicUsize>,
}

impl Recorder for LatencyRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, _key: &Key) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, _key: &Key) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key) -> Histogram {
        if key.name() == "reconcile_latency_ms" {
            Histogram::from_arc(Arc::new(Samples(Arc::clone(&self.samples))))
        } else {
            Histogram::noop()
        }
    }
}

#[tokio::test]
async fn latency_is_recorded_for_every_outcome() {
    let samples = Arc::new(AtomicUsize::new(0));
    metrics::set_boxed_recorder(Box::new(LatencyRecorder { samples: Arc::clone(&samples) })).unwrap();

    let root = MirrorRoot::parse("mirror.local").unwrap();
    let workloads = Arc::new(MockWorkloadStore::new());
    let mirror = Arc::new(Mirror::new(root.clone(), Arc::new(MockImageStore::new()), Arc::new(StaticCredentials::anonymous())));
    let reconciler = Reconciler::new(Arc::new(Config::new(root)), workloads.clone(), mirror, Arc::new(InFlightTracker::new()));

    let id = |ns: &str, name: &str| WorkloadIdentity::new(WorkloadKind::Deployment, ns, name);
    let mut mirrored = Workload::new(id("shop", "web"));
    mirrored.containers = vec![ContainerSpec::new("web", "mirror.local/index_docker_io_library_nginx:1.25")];
    workloads.insert(mirrored);
    let mut opted_out = Workload::new(id("shop", "legacy"));
    opted_out.skip = true;
    workloads.insert(opted_out);

    assert_eq!(reconciler.reconcile(&id("kube-system", "coredns")).await.unwrap(), Outcome::Excluded);
    assert_eq!(reconciler.reconcile(&id("shop", "gone")).await.unwrap(), Outcome::NotFound);
    assert_eq!(reconciler.reconcile(&id("shop", "web")).await.unwrap(), Outcome::Unchanged);
    assert_eq!(reconciler.reconcile(&id("shop", "legacy")).await.unwrap(), Outcome::Skipped);
    workloads.fail_next_gets(1);
    assert!(reconciler.reconcile(&id("shop", "web")).await.is_err());

    assert_eq!(samples.load(Ordering::SeqCst), 5);
}
