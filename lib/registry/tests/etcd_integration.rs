// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests against a live etcd cluster.
//!
//! These tests require an etcd v3 server, by default at `http://localhost:2379`.
//! Point `MERIDIAN_TEST_ETCD` at a different comma-separated endpoint list if needed.
//!
//! Run with: cargo test --test etcd_integration -- --ignored --nocapture

#![cfg(feature = "etcd")]

use std::sync::Arc;
use std::time::Duration;

use meridian_registry::config::{EtcdRegistryConfig, RegistryConfig};
use meridian_registry::directory::{Directory, EtcdDirectory};
use meridian_registry::{LeaseRegistry, Registry, ServiceInfo};

fn config() -> EtcdRegistryConfig {
    let endpoints = std::env::var("MERIDIAN_TEST_ETCD")
        .map(|v| v.split(',').map(str::to_string).collect())
        .unwrap_or_else(|_| vec!["http://localhost:2379".to_string()]);
    EtcdRegistryConfig {
        endpoints,
        service_ttl_secs: 5,
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

/// Register, observe through a watch, unregister, observe the removal.
#[tokio::test]
#[ignore] // Run manually with: cargo test --test etcd_integration test_register_and_watch -- --ignored
async fn test_register_and_watch() {
    let name = format!("it-{}", uuid::Uuid::new_v4().simple());
    let config = config();
    let directory = Arc::new(EtcdDirectory::connect(&config).await.unwrap());
    let registry = LeaseRegistry::new(directory.clone(), config).unwrap();
    assert_eq!(registry.kind(), "etcdv3");

    let info = service(&name, "127.0.0.1:19000");
    let mut watch = registry
        .watch_services(&info.service_prefix())
        .await
        .unwrap();
    assert!(watch.recv().await.unwrap().is_empty());

    registry.register_service(&info).await.unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.contains("127.0.0.1:19000"));

    let stored = directory.get(&info.registry_key()).await.unwrap().unwrap();
    assert_ne!(stored.lease, 0);

    registry.unregister_service(&info).await.unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.is_empty());

    registry.close().await.unwrap();
}

/// Closing removes every key the registry wrote.
#[tokio::test]
#[ignore] // Run manually with: cargo test --test etcd_integration test_close_cleans_up -- --ignored
async fn test_close_cleans_up() {
    let name = format!("it-{}", uuid::Uuid::new_v4().simple());
    let entry = RegistryConfig {
        etcd: config(),
        ..Default::default()
    };
    let registry = entry.build().await.unwrap();

    for port in 0..3 {
        registry
            .register_service(&service(&name, &format!("127.0.0.1:1900{port}")))
            .await
            .unwrap();
    }
    let prefix = format!("grpc:{name}/");
    assert_eq!(registry.list_services(&prefix).await.unwrap().len(), 3);

    registry.close().await.unwrap();

    let directory = EtcdDirectory::connect(&config()).await.unwrap();
    let remaining = directory
        .get_prefix(&prefix)
        .await
        .unwrap();
    assert!(remaining.is_empty());
}
