// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end registration, discovery and picking over the in-memory
//! directory.

use std::sync::Arc;
use std::time::Duration;

use meridian_registry::balancer::{Balancer, PickInfo, PickerBuilder, SubConnInfo};
use meridian_registry::config::EtcdRegistryConfig;
use meridian_registry::directory::{Directory, MemoryDirectory};
use meridian_registry::resolver::{ClientConn, ResolverBuilder, ResolverState, Target};
use meridian_registry::{Endpoints, LeaseRegistry, LocalRegistry, Registry, ServiceInfo};
use rstest::rstest;
use tokio::sync::mpsc;

fn config() -> EtcdRegistryConfig {
    EtcdRegistryConfig {
        service_ttl_secs: 5,
        retry_interval_ms: 100,
        watch_backoff_ms: 100,
        ..Default::default()
    }
}

fn service(name: &str, address: &str) -> ServiceInfo {
    ServiceInfo::builder()
        .name(name)
        .scheme("grpc")
        .address(address)
        .build()
        .unwrap()
}

fn registry(dir: &MemoryDirectory) -> LeaseRegistry {
    LeaseRegistry::new(Arc::new(dir.clone()), config()).unwrap()
}

async fn next_matching(
    rx: &mut mpsc::Receiver<Endpoints>,
    predicate: impl Fn(&Endpoints) -> bool,
) -> Endpoints {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let snapshot = rx.recv().await.expect("snapshot stream closed");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("no matching snapshot")
}

#[tokio::test(start_paused = true)]
async fn test_registration_visible_to_watchers_and_survives_lease_loss() {
    let dir = MemoryDirectory::new();
    let registry = registry(&dir);

    let mut watch = registry.watch_services("grpc:svc/").await.unwrap();
    assert!(watch.recv().await.unwrap().is_empty());

    let info = service("svc", "10.0.0.1:9000");
    registry.register_service(&info).await.unwrap();

    let snapshot = watch.recv().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("10.0.0.1:9000"), Some(&info));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let first_lease = registry.lease_id();
    assert!(dir.revoke(first_lease));

    next_matching(&mut watch, |s| s.is_empty()).await;
    let restored = next_matching(&mut watch, |s| s.contains("10.0.0.1:9000")).await;
    assert_eq!(restored.len(), 1);

    let second_lease = registry.lease_id();
    assert_ne!(second_lease, first_lease);
    assert_eq!(dir.lease_of(&info.registry_key()), Some(second_lease));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_event_fold_matches_put_put_delete() {
    let dir = MemoryDirectory::new();
    let registry = registry(&dir);
    let mut watch = registry.watch_services("grpc:svc/").await.unwrap();
    watch.recv().await.unwrap();

    let a = service("svc", "a:1");
    let b = service("svc", "b:1");
    dir.put(&a.registry_key(), &serde_json::to_string(&a).unwrap(), None)
        .await
        .unwrap();
    dir.put(&b.registry_key(), &serde_json::to_string(&b).unwrap(), None)
        .await
        .unwrap();
    dir.delete(&a.registry_key()).await.unwrap();

    let last = next_matching(&mut watch, |s| !s.contains("a:1") && s.contains("b:1")).await;
    assert_eq!(last.addresses().collect::<Vec<_>>(), vec!["b:1"]);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_entries_do_not_disturb_snapshot() {
    let dir = MemoryDirectory::new();
    let registry = registry(&dir);
    let info = service("svc", "10.0.0.1:9000");
    registry.register_service(&info).await.unwrap();

    let mut watch = registry.watch_services("grpc:svc/").await.unwrap();
    let initial = watch.recv().await.unwrap();

    dir.put("grpc:svc/malformed-key", "{\"name\":\"svc\"}", None)
        .await
        .unwrap();
    dir.put("grpc:svc/10.0.0.2:9000", "not json", None)
        .await
        .unwrap();
    let other = service("svc", "10.0.0.3:9000");
    registry.register_service(&other).await.unwrap();

    // the first snapshot published after the garbage is the one for the valid put
    let next = watch.recv().await.unwrap();
    assert_eq!(next.len(), initial.len() + 1);
    assert!(next.contains("10.0.0.3:9000"));
    assert!(!next.contains("10.0.0.2:9000"));

    registry.close().await.unwrap();
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(5)]
#[tokio::test]
async fn test_close_leaves_no_keys(#[case] count: usize) {
    let dir = MemoryDirectory::new();
    let registry = registry(&dir);
    for port in 0..count {
        registry
            .register_service(&service("svc", &format!("10.0.0.{port}:9000")))
            .await
            .unwrap();
    }
    assert_eq!(dir.keys().len(), count);

    registry.close().await.unwrap();
    assert!(dir.keys().is_empty());
}

#[tokio::test]
async fn test_registration_error_when_directory_unreachable() {
    let dir = MemoryDirectory::new();
    dir.set_available(false);
    let registry = registry(&dir);
    assert!(
        registry
            .register_service(&service("svc", "10.0.0.1:9000"))
            .await
            .is_err()
    );
    assert!(registry.watch_services("grpc:svc/").await.is_err());
}

struct ChannelConn {
    tx: mpsc::UnboundedSender<ResolverState>,
}

impl ClientConn for ChannelConn {
    fn update_state(&self, state: ResolverState) -> meridian_registry::Result<()> {
        self.tx.send(state)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_resolver_pushes_full_lists_into_balancer() {
    let dir = MemoryDirectory::new();
    let registry: Arc<dyn Registry> = Arc::new(registry(&dir));
    registry
        .register_service(&service("greeter", "10.0.0.1:9000"))
        .await
        .unwrap();

    let (tx, mut states) = mpsc::unbounded_channel();
    let target: Target = "memory:///grpc:greeter".parse().unwrap();
    let builder = ResolverBuilder::new(registry.clone());
    assert_eq!(builder.scheme(), "memory");
    let resolver = builder
        .build(&target, Arc::new(ChannelConn { tx }))
        .await
        .unwrap();

    let first = states.recv().await.unwrap();
    assert_eq!(first.addresses.len(), 1);
    assert_eq!(first.addresses[0].addr, "10.0.0.1:9000");
    assert_eq!(first.addresses[0].server_name, "grpc:greeter/");

    registry
        .register_service(&service("greeter", "10.0.0.2:9000"))
        .await
        .unwrap();
    let second = states.recv().await.unwrap();
    assert_eq!(second.addresses.len(), 2);

    let balancer = Balancer::new(PickerBuilder::new());
    balancer.update_ready(
        second
            .addresses
            .iter()
            .map(|a| (a.addr.clone(), SubConnInfo { address: a.clone() }))
            .collect(),
    );
    let info = PickInfo::new("/greeter.Greeter/SayHello");
    let picks: Vec<String> = (0..4).map(|_| balancer.pick(&info).unwrap()).collect();
    assert_eq!(
        picks,
        vec![
            "10.0.0.1:9000",
            "10.0.0.2:9000",
            "10.0.0.1:9000",
            "10.0.0.2:9000"
        ]
    );

    resolver.resolve_now();
    resolver.close().await;
    // the bridging task has exited and dropped the connection
    assert!(states.recv().await.is_none());

    registry.close().await.unwrap();
}

struct FailingConn {
    calls: mpsc::UnboundedSender<usize>,
}

impl ClientConn for FailingConn {
    fn update_state(&self, state: ResolverState) -> meridian_registry::Result<()> {
        let _ = self.calls.send(state.addresses.len());
        meridian_registry::raise!("connection manager rejected update")
    }
}

#[tokio::test]
async fn test_resolver_survives_update_failures() {
    let dir = MemoryDirectory::new();
    let registry: Arc<dyn Registry> = Arc::new(registry(&dir));
    let (calls, mut seen) = mpsc::unbounded_channel();

    let target: Target = "memory:///grpc:greeter".parse().unwrap();
    let resolver = ResolverBuilder::new(registry.clone())
        .build(&target, Arc::new(FailingConn { calls }))
        .await
        .unwrap();
    assert_eq!(seen.recv().await, Some(0));

    registry
        .register_service(&service("greeter", "10.0.0.1:9000"))
        .await
        .unwrap();
    assert_eq!(seen.recv().await, Some(1));

    resolver.close().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_resolver_build_fails_without_watch() {
    let registry: Arc<dyn Registry> = Arc::new(LocalRegistry::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let target: Target = "local:///grpc:greeter".parse().unwrap();

    let result = ResolverBuilder::new(registry)
        .build(&target, Arc::new(ChannelConn { tx }))
        .await;
    assert!(result.is_err());
}
