//! Multi-node behaviour over the in-process network

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use direktiv_cluster::{
    Bus, BusConfig, CacheConfig, CacheManager, LocalNetwork, StaticFinder,
};

const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];

async fn cluster() -> (LocalNetwork, Vec<Bus>) {
    let net = LocalNetwork::new();
    let addresses: Vec<String> = NODES.iter().map(|n| n.to_string()).collect();
    let mut buses = Vec::new();
    for name in NODES {
        let bus = Bus::new(
            BusConfig::new(name, name).with_fanout(3),
            Arc::new(net.transport()),
            Arc::new(StaticFinder::new(addresses.clone())),
        );
        bus.serve_inbox(net.attach(name));
        bus.discover().await;
        buses.push(bus);
    }
    converge(&buses).await;
    (net, buses)
}

async fn converge(buses: &[Bus]) {
    for _ in 0..3 {
        for bus in buses {
            bus.gossip_round().await;
        }
        settle().await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_membership_converges() {
    let (_net, buses) = cluster().await;
    for bus in &buses {
        let names: Vec<String> = bus.nodes().into_iter().map(|m| m.name).collect();
        assert_eq!(names, NODES.to_vec());
    }
}

#[tokio::test]
async fn test_shared_channel_delivers_once_cluster_wide() {
    let (_net, buses) = cluster().await;
    let count = Arc::new(AtomicUsize::new(0));
    let mut subs = Vec::new();
    for bus in &buses {
        let c = count.clone();
        subs.push(
            bus.subscribe("work", "workers", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap(),
        );
    }
    converge(&buses).await;

    for i in 0..20 {
        buses[i % 3].publish("work", vec![]).await.unwrap();
    }
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_per_instance_channel_reaches_every_node() {
    let (_net, buses) = cluster().await;
    let count = Arc::new(AtomicUsize::new(0));
    let mut subs = Vec::new();
    for bus in &buses {
        let c = count.clone();
        subs.push(
            bus.subscribe_per_instance("broadcast", "all", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap(),
        );
    }
    converge(&buses).await;

    buses[0].publish("broadcast", b"hi".to_vec()).await.unwrap();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_left_node_is_tombstoned() {
    let (net, buses) = cluster().await;
    buses[2].shutdown().await;
    net.detach("node-c");
    settle().await;

    for bus in &buses[..2] {
        let names: Vec<String> = bus.nodes().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["node-a".to_string(), "node-b".to_string()]);
    }
}

#[tokio::test]
async fn test_cache_invalidation_is_coherent() {
    let (_net, buses) = cluster().await;
    let managers: Vec<CacheManager> = buses
        .iter()
        .map(|b| CacheManager::clustered(b.clone(), CacheConfig::default()).unwrap())
        .collect();
    let caches: Vec<_> = managers.iter().map(|m| m.cache("files").unwrap()).collect();
    converge(&buses).await;

    for cache in &caches {
        cache
            .get_or_fetch("ns:/wf.yaml", Duration::ZERO, || async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"v1"))
            })
            .await
            .unwrap();
    }

    // Writer keeps its new value; everyone else drops the stale one
    caches[0]
        .set("ns:/wf.yaml", Bytes::from_static(b"v2"), Duration::ZERO)
        .await
        .unwrap();
    settle().await;
    assert_eq!(caches[0].get("ns:/wf.yaml").unwrap(), Bytes::from_static(b"v2"));
    assert!(caches[1].get("ns:/wf.yaml").is_none());
    assert!(caches[2].get("ns:/wf.yaml").is_none());

    for cache in &caches[1..] {
        cache
            .get_or_fetch("other", Duration::ZERO, || async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"x"))
            })
            .await
            .unwrap();
    }
    caches[0].invalidate_all().await.unwrap();
    settle().await;
    assert!(caches.iter().all(|c| c.is_empty()));
}
