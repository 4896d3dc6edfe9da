//! 存储后端集成测试
//!
//! 使用进程内存储，时间相关的用例在暂停的 tokio 时钟上运行。

use flare_discovery::{
    CancelRegistry, Discovery, DiscoveryError, EventKind, KeepAliveReport, KeyCodec, LeaseHandle,
    MemoryStore, Node, NodeType, StoreDiscovery, StoreDiscoveryOptions,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};

fn setup() -> (Arc<MemoryStore>, Arc<StoreDiscovery>) {
    let store = Arc::new(MemoryStore::new());
    let discovery = StoreDiscovery::new(
        store.clone(),
        KeyCodec::default(),
        StoreDiscoveryOptions::default(),
    );
    (store, Arc::new(discovery))
}

fn orders(id: &str) -> Node {
    Node::with_id(id, "orders", NodeType::Rpc).address("10.0.0.1", 9000)
}

fn spawn_keep_alive(
    discovery: &Arc<StoreDiscovery>,
    node: &Node,
    lease: &LeaseHandle,
) -> JoinHandle<flare_discovery::Result<KeepAliveReport>> {
    let discovery = discovery.clone();
    let node = node.clone();
    let lease = lease.clone();
    tokio::spawn(async move { discovery.keep_alive(&node, &lease).await })
}

#[tokio::test]
async fn test_register_then_lookup() {
    let (_store, discovery) = setup();
    let node = orders("a1");

    let lease = discovery.register(&node).await.unwrap();
    assert!(lease.is_active());

    let nodes = discovery.node("orders", NodeType::Rpc, None).await.unwrap();
    assert_eq!(nodes, vec![node]);
}

#[tokio::test]
async fn test_register_overwrites_stale_record() {
    let (store, discovery) = setup();
    let node = orders("a1");

    discovery.register(&node).await.unwrap();
    let moved = orders("a1").address("10.0.0.2", 9001);
    let lease = discovery.register(&moved).await.unwrap();

    let nodes = discovery.node("orders", NodeType::Rpc, None).await.unwrap();
    assert_eq!(nodes, vec![moved.clone()]);
    assert_eq!(
        store.lease_of(&discovery.codec().key_of(&moved)).await,
        lease.id()
    );
}

#[tokio::test]
async fn test_register_surfaces_store_error() {
    let (store, discovery) = setup();
    store.set_unavailable(true);

    let err = discovery.register(&orders("a1")).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Store(_)), "{:?}", err);
    assert!(err.is_retryable());
    // 注册内部不重试
    assert_eq!(store.stats().grants, 1);
}

#[tokio::test]
async fn test_unknown_service_returns_empty() {
    let (_store, discovery) = setup();
    let nodes = discovery
        .node("unknown-service", NodeType::Http, None)
        .await
        .unwrap();
    assert!(nodes.is_empty());

    let tagged = discovery
        .node("unknown-service", NodeType::Tcp, Some("blue"))
        .await
        .unwrap();
    assert!(tagged.is_empty());
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let (store, discovery) = setup();
    let first = orders("a1");
    let second = orders("a2");
    discovery.register(&first).await.unwrap();
    discovery.register(&second).await.unwrap();
    store
        .insert_raw("/flare/orders/rpc/broken", "{not json")
        .await;

    let nodes = discovery.node("orders", NodeType::Rpc, None).await.unwrap();
    assert_eq!(nodes, vec![first.clone(), second.clone()]);

    let scan = discovery.scan("orders", NodeType::Rpc, None).await.unwrap();
    assert_eq!(scan.nodes.len(), 2);
    assert_eq!(scan.skipped, 1);
}

#[tokio::test]
async fn test_lookup_keeps_tags_apart() {
    let (_store, discovery) = setup();
    let plain = orders("a1");
    let blue = orders("b1").tag("blue");
    // 标签与类型同名的节点不能出现在无标签查询里
    let tricky = Node::with_id("x1", "orders", NodeType::Http).tag("rpc");
    for node in [&plain, &blue, &tricky] {
        discovery.register(node).await.unwrap();
    }

    assert_eq!(
        discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
        vec![plain]
    );
    assert_eq!(
        discovery.node("orders", NodeType::Rpc, Some("blue")).await.unwrap(),
        vec![blue]
    );
    assert_eq!(
        discovery.node("orders", NodeType::Http, Some("rpc")).await.unwrap(),
        vec![tricky]
    );
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let (store, discovery) = setup();
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();

    discovery.deregister(&node, &lease).await.unwrap();
    assert!(!lease.is_active());
    assert!(discovery.node("orders", NodeType::Rpc, None).await.unwrap().is_empty());

    discovery.deregister(&node, &lease).await.unwrap();
    assert_eq!(store.stats().revokes, 1);

    // 从未注册过的节点
    discovery
        .deregister(&orders("ghost"), &LeaseHandle::new())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deregister_after_expiry_is_ok() {
    let (_store, discovery) = setup();
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();

    sleep(Duration::from_secs(31)).await;
    discovery.deregister(&node, &lease).await.unwrap();
    assert!(!lease.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_renews_past_ttl() {
    let (store, discovery) = setup();
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();
    let task = spawn_keep_alive(&discovery, &node, &lease);

    sleep(Duration::from_secs(95)).await;
    assert_eq!(
        discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
        vec![node.clone()]
    );
    assert_eq!(store.stats().grants, 1);

    discovery.deregister(&node, &lease).await.unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(
        report,
        KeepAliveReport {
            ticks: 9,
            renewed: 9,
            recovered: 0,
            failed: 0
        }
    );
    assert!(discovery.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_self_heals_after_failed_renewal() {
    let (store, discovery) = setup();
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();
    let first_lease = lease.id();
    let task = spawn_keep_alive(&discovery, &node, &lease);

    // 第一次续约（t=10）成功
    sleep(Duration::from_secs(11)).await;
    assert_eq!(store.stats().keep_alives, 1);

    // 第二次续约（t=20）失败，随后以新租约重新注册
    store.fail_next_keep_alives(1);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(store.stats().grants, 2);
    assert_ne!(lease.id(), first_lease);
    assert!(!task.is_finished());

    // 第三次续约（t=30）使用新租约
    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
        vec![node.clone()]
    );

    discovery.deregister(&node, &lease).await.unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(
        report,
        KeepAliveReport {
            ticks: 3,
            renewed: 2,
            recovered: 1,
            failed: 0
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_without_lease_fails_only_its_task() {
    let (_store, discovery) = setup();
    let healthy = orders("a1");
    let lease = discovery.register(&healthy).await.unwrap();
    let healthy_task = spawn_keep_alive(&discovery, &healthy, &lease);

    let orphan = orders("b2");
    let err = discovery
        .keep_alive(&orphan, &LeaseHandle::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, DiscoveryError::LeaseNotFound { ref node_id } if node_id == "b2"),
        "{:?}",
        err
    );
    assert!(!discovery.registry().contains("b2").await);

    sleep(Duration::from_secs(15)).await;
    assert!(!healthy_task.is_finished());
    assert!(discovery.registry().contains("a1").await);

    discovery.deregister(&healthy, &lease).await.unwrap();
    let report = healthy_task.await.unwrap().unwrap();
    assert_eq!(report.renewed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_keep_alive_supersedes_first() {
    let (_store, discovery) = setup();
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();

    let first = spawn_keep_alive(&discovery, &node, &lease);
    sleep(Duration::from_secs(1)).await;
    let second = spawn_keep_alive(&discovery, &node, &lease);

    let superseded = timeout(Duration::from_secs(1), first)
        .await
        .expect("superseded keep-alive should stop")
        .unwrap()
        .unwrap();
    assert_eq!(superseded.ticks, 0);
    // 旧任务退出不会移除新任务的登记
    assert!(discovery.registry().contains("a1").await);

    sleep(Duration::from_secs(11)).await;
    discovery.deregister(&node, &lease).await.unwrap();
    let report = second.await.unwrap().unwrap();
    assert_eq!(report.renewed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_injected_registry_is_shared() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(CancelRegistry::new());
    let discovery = Arc::new(
        StoreDiscovery::new(store, KeyCodec::default(), StoreDiscoveryOptions::default())
            .with_registry(registry.clone()),
    );
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();
    let task = spawn_keep_alive(&discovery, &node, &lease);

    sleep(Duration::from_secs(1)).await;
    assert!(registry.contains("a1").await);
    assert!(registry.cancel("a1").await);
    assert_eq!(task.await.unwrap().unwrap().ticks, 0);
}

/// 注册 → 续约中断超过 TTL 后节点消失 → 存储恢复后下一次续约重新出现
#[tokio::test(start_paused = true)]
async fn test_lease_death_and_recovery_scenario() {
    let (store, discovery) = setup();
    let node = Node::with_id("a1", "orders", NodeType::Rpc);
    let lease = discovery.register(&node).await.unwrap();
    let task = spawn_keep_alive(&discovery, &node, &lease);

    assert_eq!(
        discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
        vec![node.clone()]
    );

    store.reject_keep_alives(true);
    store.reject_grants(true);
    sleep(Duration::from_secs(41)).await;
    assert!(discovery.node("orders", NodeType::Rpc, None).await.unwrap().is_empty());

    store.reject_keep_alives(false);
    store.reject_grants(false);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
        vec![node.clone()]
    );

    discovery.deregister(&node, &lease).await.unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(
        report,
        KeepAliveReport {
            ticks: 5,
            renewed: 0,
            recovered: 1,
            failed: 4
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_renew_timeout_is_configurable() {
    let store = Arc::new(MemoryStore::new());
    let options = StoreDiscoveryOptions {
        keep_alive_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let discovery = Arc::new(StoreDiscovery::new(store.clone(), KeyCodec::default(), options));
    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();
    assert_eq!(discovery.options().renew_timeout(), Duration::from_secs(2));

    let task = spawn_keep_alive(&discovery, &node, &lease);
    sleep(Duration::from_secs(11)).await;
    discovery.deregister(&node, &lease).await.unwrap();
    assert_eq!(task.await.unwrap().unwrap().renewed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_watch_emits_add_and_remove() {
    let (_store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();
    assert_eq!(watcher.prefix(), "/flare/orders/rpc/");

    let node = orders("a1");
    let lease = discovery.register(&node).await.unwrap();
    let added = watcher.recv().await.unwrap();
    assert_eq!(added.event, EventKind::Add);
    assert_eq!(added.nodes, vec![node.clone()]);

    discovery.deregister(&node, &lease).await.unwrap();
    let removed = watcher.recv().await.unwrap();
    assert_eq!(removed.event, EventKind::Remove);
    assert_eq!(removed.nodes, vec![node]);

    // 每个变化只产生一个事件
    assert!(timeout(Duration::from_secs(1), watcher.recv()).await.is_err());
    assert_eq!(watcher.stats().delivered(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_watch_reports_lease_expiry_as_remove() {
    let (_store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();
    let node = orders("a1");
    discovery.register(&node).await.unwrap();
    assert_eq!(watcher.recv().await.unwrap().event, EventKind::Add);

    // 不做任何其它存储调用，过期由存储自己发现
    let removed = timeout(Duration::from_secs(120), watcher.recv())
        .await
        .expect("lease expiry should reach the watcher")
        .unwrap();
    assert_eq!(removed.event, EventKind::Remove);
    assert_eq!(removed.nodes, vec![node.clone()]);
    assert!(discovery.node("orders", NodeType::Rpc, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_watch_skips_malformed_and_foreign_changes() {
    let (store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();

    store.insert_raw("/flare/orders/rpc/broken", "garbage").await;
    discovery
        .register(&Node::with_id("x1", "orders", NodeType::Http).tag("rpc"))
        .await
        .unwrap();
    let node = orders("a1");
    discovery.register(&node).await.unwrap();

    let event = watcher.recv().await.unwrap();
    assert_eq!(event.nodes, vec![node]);
    assert_eq!(watcher.stats().skipped(), 1);
    assert_eq!(watcher.stats().delivered(), 1);
}

#[tokio::test]
async fn test_watch_ends_with_underlying_stream() {
    let (store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();

    store.close_watches().await;
    assert!(watcher.recv().await.is_none());
    assert!(!watcher.is_closed());
}

#[tokio::test]
async fn test_watch_close_stops_delivery() {
    let (_store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();

    watcher.close();
    assert!(watcher.is_closed());
    discovery.register(&orders("a1")).await.unwrap();
    assert!(watcher.recv().await.is_none());
}

#[tokio::test]
async fn test_watch_on_unreachable_store_fails() {
    let (store, discovery) = setup();
    store.set_unavailable(true);
    assert!(discovery.watch("orders", NodeType::Rpc, None).await.is_err());
}

#[tokio::test]
async fn test_watch_as_stream() {
    use futures::StreamExt;

    let (_store, discovery) = setup();
    let watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();
    discovery.register(&orders("a1")).await.unwrap();
    discovery.register(&orders("a2")).await.unwrap();

    let events: Vec<_> = watcher.take(2).collect().await;
    let ids: Vec<_> = events.iter().map(|e| e.nodes[0].id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_watch_is_pending_without_changes() {
    let (_store, discovery) = setup();
    let mut watcher = discovery.watch("orders", NodeType::Rpc, None).await.unwrap();

    let mut next = tokio_test::task::spawn(watcher.recv());
    tokio_test::assert_pending!(next.poll());
}
