//! Collector cache scenarios: expiry timing, snapshot coherence, invariants

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use haneul::collector::{
    CollectorConfig, FlavorRegistry, NetMetrics, SiteCache, Snapshot,
};
use haneul::models::{ResourceRequest, Selected, Site, Workload};
use tokio::sync::watch;

fn fast_cache() -> Arc<SiteCache> {
    SiteCache::new(
        CollectorConfig {
            ttl: Duration::from_millis(100),
            period: Duration::from_millis(20),
        },
        Arc::new(FlavorRegistry::new()),
    )
}

fn workload(uid: &str, site_id: &str, vcpus: u64) -> Workload {
    let mut workload = Workload::new(uid, format!("pod-{uid}"));
    workload.selected = Some(Selected {
        site_id: site_id.to_string(),
        region: "kr-north-1".to_string(),
        availability_zone: "az1".to_string(),
        flavor_id: String::new(),
    });
    workload.resources = ResourceRequest {
        vcpus,
        memory_mb: vcpus * 1024,
        volume_gb: 0,
        eip: false,
    };
    workload
}

/// Assumed workload expires on the sweep after its deadline, with exactly two
/// generation bumps on the site (assume, remove)
#[tokio::test]
async fn test_assumed_workload_expiry_timing() {
    let cache = fast_cache();
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = cache.run(stop_rx);

    cache
        .add_site(Site::new("s1", "kr-north-1", "az1"))
        .await;
    let generation_before = cache.dump().await.site_infos["s1"].generation();

    cache.assume_workload(workload("w1", "s1", 2)).await.unwrap();
    cache.finish_binding("w1", true).await.unwrap();

    // Half the TTL in: nothing has changed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.is_assumed("w1").await);
    assert!(cache.workload("w1").await.is_some());

    // Past the TTL plus sweep cadence: gone from every table.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!cache.is_assumed("w1").await);
    assert!(cache.workload("w1").await.is_none());

    let dump = cache.dump().await;
    assert_eq!(dump.site_infos["s1"].workload_count(), 0);
    assert_eq!(dump.site_infos["s1"].requested().vcpus, 0);
    assert_eq!(dump.site_infos["s1"].generation(), generation_before + 2);
    assert!(dump.assumed.is_empty());

    stop_tx.send(true).unwrap();
    sweeper.await.unwrap();
}

/// The snapshot protocol stays coherent across site churn and repeated
/// refreshes of the same snapshot value
#[tokio::test]
async fn test_snapshot_coherence_across_churn() {
    let cache = fast_cache();
    let mut snapshot = Snapshot::new();

    // Sites spread over three zones.
    for (id, zone) in [
        ("a1", "az1"),
        ("a2", "az1"),
        ("b1", "az2"),
        ("b2", "az2"),
        ("c1", "az3"),
    ] {
        cache.add_site(Site::new(id, "kr-north-1", zone)).await;
    }

    cache.update_snapshot(&mut snapshot).await.unwrap();
    assert_eq!(snapshot.len(), 5);
    let stats = cache.stats().await;
    assert_eq!(snapshot.len(), stats.sites);
    assert_eq!(snapshot.generation(), stats.generation);

    // Touch two sites; refresh shares everything else.
    let untouched = Arc::clone(snapshot.site_info("c1").unwrap());
    cache
        .update_qos(
            "a1",
            NetMetrics {
                latency_ms: 1.0,
                packet_loss_pct: 0.0,
                bandwidth_mbps: 1000.0,
            },
        )
        .await;
    cache.assume_workload(workload("w1", "b1", 1)).await.unwrap();
    cache.update_snapshot(&mut snapshot).await.unwrap();

    assert!(Arc::ptr_eq(&untouched, snapshot.site_info("c1").unwrap()));
    assert_eq!(snapshot.site_info("b1").unwrap().workload_count(), 1);
    assert!(snapshot.site_info("a1").unwrap().qos().is_some());

    // Remove a site and add another; list membership tracks the tree.
    cache.remove_site("a2").await.unwrap();
    cache.add_site(Site::new("d1", "kr-north-1", "az4")).await;
    cache.update_snapshot(&mut snapshot).await.unwrap();

    let ids: HashSet<String> = snapshot
        .site_info_list()
        .iter()
        .map(|info| info.site_id().to_string())
        .collect();
    assert_eq!(snapshot.len(), 5);
    assert!(!ids.contains("a2"));
    assert!(ids.contains("d1"));
    assert_eq!(ids.len(), snapshot.len());

    // Map and list always agree.
    for info in snapshot.site_info_list() {
        assert!(Arc::ptr_eq(
            info,
            snapshot.site_info(info.site_id()).unwrap()
        ));
    }
}

/// A workload confirmed on a different site than it was assumed to never
/// double counts
#[tokio::test]
async fn test_no_workload_counted_twice_after_relocation() {
    let cache = fast_cache();
    cache.add_site(Site::new("s1", "kr-north-1", "az1")).await;
    cache.add_site(Site::new("s2", "kr-north-1", "az1")).await;

    cache.assume_workload(workload("w1", "s1", 2)).await.unwrap();
    cache.add_workload(workload("w1", "s2", 2)).await.unwrap();

    let dump = cache.dump().await;
    let holders: Vec<&str> = dump
        .site_infos
        .iter()
        .filter(|(_, info)| info.has_workload("w1"))
        .map(|(site_id, _)| site_id.as_str())
        .collect();
    assert_eq!(holders, vec!["s2"]);
    assert!(dump.assumed.is_empty());

    // Accounting followed the workload.
    assert_eq!(dump.site_infos["s1"].requested().vcpus, 0);
    assert_eq!(dump.site_infos["s2"].requested().vcpus, 2);
}

/// Expiry never fires while the bind call is still in flight, then fires on
/// the next sweep after the deadline
#[tokio::test]
async fn test_unfinished_binding_survives_sweeps() {
    let cache = fast_cache();
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = cache.run(stop_rx);

    cache.assume_workload(workload("w1", "s1", 1)).await.unwrap();

    // Far past the TTL with binding unfinished: still assumed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cache.is_assumed("w1").await);

    // The late confirmation re-arms the deadline; only then does the
    // workload expire.
    cache.finish_binding("w1", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!cache.is_assumed("w1").await);

    stop_tx.send(true).unwrap();
    sweeper.await.unwrap();
}

/// Stats and MRU stay mutually consistent through a random-ish op sequence
#[tokio::test]
async fn test_cache_internal_consistency() {
    let cache = fast_cache();

    for index in 0..8 {
        let zone = format!("az{}", index % 3);
        cache
            .add_site(Site::new(format!("s{index}"), "kr-north-1", &zone))
            .await;
    }
    for index in 0..5 {
        cache
            .assume_workload(workload(
                &format!("w{index}"),
                &format!("s{}", index % 4),
                1,
            ))
            .await
            .unwrap();
    }
    cache.remove_site("s7").await.unwrap();
    cache.forget_workload(&workload("w0", "s0", 1)).await.unwrap();
    cache.add_workload(workload("w9", "s3", 2)).await.unwrap();

    let stats = cache.stats().await;
    let mru = cache.mru_site_ids().await;
    assert_eq!(mru.len(), stats.sites);
    assert_eq!(
        mru.iter().collect::<HashSet<_>>().len(),
        mru.len(),
        "MRU list contains duplicates"
    );
    assert_eq!(stats.assumed, 4);
    assert_eq!(stats.workloads, 5);

    // A snapshot built now satisfies the size post-condition.
    let mut snapshot = Snapshot::new();
    cache.update_snapshot(&mut snapshot).await.unwrap();
    assert_eq!(snapshot.len(), stats.sites);
}
