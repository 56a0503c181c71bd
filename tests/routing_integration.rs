//! End-to-end routing scenarios: store events in, converged bindings out

use std::sync::Arc;
use std::time::Duration;

use haneul::models::{Cluster, ResourceKey, Scheduler, SchedulerStatus};
use haneul::routing::{
    EventKind, RecordingEventSink, RecordingProcessManager, RoutingConfig, RoutingController,
};
use haneul::store::{MemoryStore, ObjectStore};
use tokio::sync::watch;

struct ControlPlane {
    schedulers: Arc<MemoryStore<Scheduler>>,
    clusters: Arc<MemoryStore<Cluster>>,
    processes: Arc<RecordingProcessManager>,
    recorder: Arc<RecordingEventSink>,
    controller: Arc<RoutingController>,
    stop_tx: watch::Sender<bool>,
    run: tokio::task::JoinHandle<()>,
}

async fn start_control_plane() -> ControlPlane {
    let schedulers = Arc::new(MemoryStore::new());
    let clusters = Arc::new(MemoryStore::new());
    let processes = Arc::new(RecordingProcessManager::new());
    let recorder = Arc::new(RecordingEventSink::new());

    let controller = RoutingController::new(
        Arc::clone(&schedulers) as Arc<dyn ObjectStore<Scheduler>>,
        Arc::clone(&clusters) as Arc<dyn ObjectStore<Cluster>>,
        Arc::clone(&processes) as _,
        Arc::clone(&recorder) as _,
        RoutingConfig::default(),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let run = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run(stop_rx).await })
    };

    ControlPlane {
        schedulers,
        clusters,
        processes,
        recorder,
        controller,
        stop_tx,
        run,
    }
}

async fn shutdown(plane: ControlPlane) {
    plane.stop_tx.send(true).unwrap();
    plane.run.await.unwrap();
}

/// Poll until the condition is satisfied or a 5s deadline passes
macro_rules! wait_until {
    ($cond:expr, $message:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}", $message);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

async fn seed_scheduler(plane: &ControlPlane, name: &str, tag: &str) {
    plane
        .schedulers
        .create(Scheduler::new(name, tag))
        .await
        .unwrap();
    let key = ResourceKey::system(name);
    wait_until!(
        plane
            .schedulers
            .get(&key)
            .await
            .map(|s| s.status == SchedulerStatus::Active)
            .unwrap_or(false),
        "scheduler never became active"
    );
}

async fn seed_cluster(plane: &ControlPlane, name: &str, ip: &str) -> Cluster {
    let created = plane
        .clusters
        .create(Cluster::new(name, "default", ip))
        .await
        .unwrap();
    let key = created.key();
    wait_until!(
        plane
            .clusters
            .get(&key)
            .await
            .map(|c| c.has_home())
            .unwrap_or(false),
        "cluster never got a home"
    );
    plane.clusters.get(&key).await.unwrap()
}

/// Every cluster's persisted home matches the live ring
async fn assert_homes_match_ring(plane: &ControlPlane) {
    for cluster in plane.clusters.list().await.unwrap() {
        let expected = plane
            .controller
            .lookup_home(&cluster.ip_address)
            .await
            .unwrap();
        assert_eq!(
            cluster.home_scheduler, expected,
            "cluster {} home diverges from ring",
            cluster.name
        );
    }
}

#[tokio::test]
async fn test_clusters_follow_ring_assignment() {
    let plane = start_control_plane().await;

    seed_scheduler(&plane, "sched-a", "tag-a").await;
    seed_scheduler(&plane, "sched-b", "tag-b").await;
    assert!(plane.processes.is_running("tag-a"));
    assert!(plane.processes.is_running("tag-b"));

    for (name, ip) in [
        ("c1", "10.0.0.1"),
        ("c2", "10.0.0.2"),
        ("c3", "10.0.0.3"),
        ("c4", "10.0.0.4"),
    ] {
        let cluster = seed_cluster(&plane, name, ip).await;
        assert!(["sched-a", "sched-b"].contains(&cluster.home_scheduler.as_str()));
    }
    assert_homes_match_ring(&plane).await;

    // Owned cluster lists line up with the bindings. The list update lands
    // just after the home is persisted, so poll for it.
    wait_until!(
        {
            let mut owned_total = 0;
            for scheduler in plane.schedulers.list().await.unwrap() {
                owned_total += scheduler.clusters.len();
            }
            owned_total == 4
        },
        "scheduler cluster lists never caught up"
    );
    for scheduler in plane.schedulers.list().await.unwrap() {
        for cluster_ref in &scheduler.clusters {
            let cluster = plane.clusters.get(&cluster_ref.key()).await.unwrap();
            assert_eq!(cluster.home_scheduler, scheduler.name);
        }
    }

    // Every processed object carries a Synced event.
    let reasons = plane.recorder.reasons_for(&ResourceKey::new("system", "default", "c1"));
    assert!(reasons.iter().any(|reason| reason == "Synced"));

    shutdown(plane).await;
}

#[tokio::test]
async fn test_scheduler_loss_rehomes_orphans_only() {
    let plane = start_control_plane().await;
    seed_scheduler(&plane, "sched-a", "tag-a").await;
    seed_scheduler(&plane, "sched-b", "tag-b").await;

    let c1 = seed_cluster(&plane, "c1", "10.0.0.1").await;
    let c2 = seed_cluster(&plane, "c2", "10.0.0.2").await;

    // Delete the scheduler homing c1; the survivor keeps its clusters.
    let victim = c1.home_scheduler.clone();
    let survivor = if victim == "sched-a" { "sched-b" } else { "sched-a" };
    let victim_tag = plane
        .schedulers
        .get(&ResourceKey::system(&victim))
        .await
        .unwrap()
        .tag
        .clone();

    plane
        .schedulers
        .delete(&ResourceKey::system(&victim))
        .await
        .unwrap();

    wait_until!(
        plane.controller.ring_members().await == vec![survivor.to_string()],
        "ring never dropped the deleted scheduler"
    );
    wait_until!(
        plane
            .clusters
            .get(&c1.key())
            .await
            .map(|c| c.home_scheduler == survivor)
            .unwrap_or(false),
        "orphaned cluster never re-homed"
    );

    // The worker was terminated exactly once.
    wait_until!(
        plane.processes.closes() == vec![victim_tag.clone()],
        "victim worker not closed exactly once"
    );
    assert!(!plane.processes.is_running(&victim_tag));

    // A cluster already on the survivor is untouched.
    if c2.home_scheduler == survivor {
        let c2_now = plane.clusters.get(&c2.key()).await.unwrap();
        assert_eq!(c2_now.home_scheduler, survivor);
        assert_eq!(c2_now.resource_version, c2.resource_version);
    }
    assert_homes_match_ring(&plane).await;

    // The scheduler record is gone.
    assert!(plane
        .schedulers
        .get(&ResourceKey::system(&victim))
        .await
        .unwrap_err()
        .is_not_found());

    shutdown(plane).await;
}

#[tokio::test]
async fn test_event_redelivery_reaches_steady_state() {
    let plane = start_control_plane().await;
    seed_scheduler(&plane, "sched-a", "tag-a").await;
    let cluster = seed_cluster(&plane, "c1", "10.0.0.1").await;
    wait_until!(
        plane
            .schedulers
            .get(&ResourceKey::system("sched-a"))
            .await
            .map(|s| s.owns_cluster("c1"))
            .unwrap_or(false),
        "cluster never attached to its scheduler"
    );

    // Redeliver the same events; state must not move.
    plane
        .controller
        .enqueue(EventKind::CreateScheduler, ResourceKey::system("sched-a"));
    plane
        .controller
        .enqueue(EventKind::AddCluster, cluster.key());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let scheduler = plane
        .schedulers
        .get(&ResourceKey::system("sched-a"))
        .await
        .unwrap();
    assert_eq!(scheduler.clusters.len(), 1);
    assert_eq!(plane.processes.launches(), vec!["tag-a"]);

    let unchanged = plane.clusters.get(&cluster.key()).await.unwrap();
    assert_eq!(unchanged.home_scheduler, cluster.home_scheduler);
    assert_eq!(unchanged.resource_version, cluster.resource_version);

    shutdown(plane).await;
}

#[tokio::test]
async fn test_cluster_added_before_any_scheduler() {
    let plane = start_control_plane().await;

    // No scheduler yet: homing must park in retry rather than fail.
    plane
        .clusters
        .create(Cluster::new("c1", "default", "10.0.0.1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = plane
        .clusters
        .get(&ResourceKey::new("system", "default", "c1"))
        .await
        .unwrap();
    assert!(!pending.has_home());

    // Once a scheduler registers, the retry lands.
    seed_scheduler(&plane, "sched-a", "tag-a").await;
    wait_until!(
        plane
            .clusters
            .get(&ResourceKey::new("system", "default", "c1"))
            .await
            .map(|c| c.home_scheduler == "sched-a")
            .unwrap_or(false),
        "cluster never homed after scheduler arrived"
    );

    shutdown(plane).await;
}
