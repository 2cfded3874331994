// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time view of the live instances under one service prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::directory::{KeyValue, WatchEvent, WatchEventKind};
use crate::service::{ServiceInfo, is_host_port};

/// Address to [`ServiceInfo`] mapping for one watched prefix.
///
/// Every publish hands out an owned copy; consumers never observe a snapshot
/// being mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    nodes: BTreeMap<String, ServiceInfo>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<&ServiceInfo> {
        self.nodes.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Addresses in order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceInfo)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Apply one watch event. Returns `true` when the event addressed a
    /// service entry and was applied.
    ///
    /// Keys whose residual after `prefix` is not a `host:port` are not
    /// service entries and are ignored. Puts with an undecodable value are
    /// logged and skipped. Deletes remove only the addressed entry.
    pub fn apply(&mut self, prefix: &str, event: &WatchEvent) -> bool {
        let Some(address) = residual_address(prefix, &event.kv.key) else {
            tracing::trace!(key = %event.kv.key, "ignoring non-service key");
            return false;
        };

        match event.kind {
            WatchEventKind::Put => match decode(&event.kv) {
                Some(info) => {
                    self.nodes.insert(address.to_string(), info);
                    true
                }
                None => false,
            },
            WatchEventKind::Delete => {
                self.nodes.remove(address);
                true
            }
        }
    }

    /// Upsert a key-value read outside the event stream.
    pub fn insert_kv(&mut self, prefix: &str, kv: &KeyValue) -> bool {
        let Some(address) = residual_address(prefix, &kv.key) else {
            return false;
        };
        match decode(kv) {
            Some(info) => {
                self.nodes.insert(address.to_string(), info);
                true
            }
            None => false,
        }
    }

    /// Bring the snapshot in line with a full listing of the prefix: entries
    /// are upserted and addresses missing from the listing are dropped.
    /// Returns `true` if anything changed.
    pub fn reconcile(&mut self, prefix: &str, listing: &[KeyValue]) -> bool {
        let mut fresh = Endpoints::new();
        for kv in listing {
            fresh.insert_kv(prefix, kv);
        }
        if fresh == *self {
            return false;
        }
        *self = fresh;
        true
    }
}

impl FromIterator<ServiceInfo> for Endpoints {
    fn from_iter<I: IntoIterator<Item = ServiceInfo>>(iter: I) -> Self {
        Self {
            nodes: iter
                .into_iter()
                .map(|info| (info.address.clone(), info))
                .collect(),
        }
    }
}

fn residual_address<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|addr| is_host_port(addr))
}

fn decode(kv: &KeyValue) -> Option<ServiceInfo> {
    match ServiceInfo::from_json(&kv.value) {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::warn!(key = %kv.key, error = %e, "skipping malformed service entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PREFIX: &str = "grpc:svc/";

    fn info(address: &str) -> ServiceInfo {
        ServiceInfo::builder()
            .id(format!("svc-{address}"))
            .name("svc")
            .scheme("grpc")
            .address(address)
            .build()
            .unwrap()
    }

    fn put(address: &str) -> WatchEvent {
        let info = info(address);
        WatchEvent {
            kind: WatchEventKind::Put,
            kv: KeyValue {
                key: info.registry_key(),
                value: info.to_json().unwrap().into_bytes(),
                mod_revision: 1,
                lease: 0,
            },
        }
    }

    fn delete(address: &str) -> WatchEvent {
        WatchEvent {
            kind: WatchEventKind::Delete,
            kv: KeyValue {
                key: format!("{PREFIX}{address}"),
                value: Vec::new(),
                mod_revision: 2,
                lease: 0,
            },
        }
    }

    #[test]
    fn test_put_put_delete_leaves_survivor() {
        let mut endpoints = Endpoints::new();
        for event in [put("a:1"), put("b:1"), delete("a:1")] {
            assert!(endpoints.apply(PREFIX, &event));
        }
        assert_eq!(endpoints.addresses().collect::<Vec<_>>(), vec!["b:1"]);
    }

    #[test]
    fn test_put_is_idempotent() {
        let event = put("a:1");
        let mut once = Endpoints::new();
        assert!(once.apply(PREFIX, &event));

        let mut twice = once.clone();
        assert!(twice.apply(PREFIX, &event));
        assert_eq!(once, twice);
        assert_eq!(twice.get("a:1"), Some(&info("a:1")));
    }

    /// Random put/delete sequences over a small address pool fold to the
    /// set of addresses put and not deleted afterwards.
    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(42)]
    #[case(1337)]
    #[case(90210)]
    fn test_random_sequences_fold_to_live_set(#[case] seed: u64) {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::BTreeSet;

        const POOL: [&str; 5] = ["a:1", "b:1", "c:1", "10.0.0.1:80", "[::1]:9000"];

        let mut rng = StdRng::seed_from_u64(seed);
        let mut endpoints = Endpoints::new();
        let mut live = BTreeSet::new();

        for _ in 0..500 {
            let address = POOL[rng.random_range(0..POOL.len())];
            if rng.random_bool(0.6) {
                endpoints.apply(PREFIX, &put(address));
                live.insert(address.to_string());
            } else {
                endpoints.apply(PREFIX, &delete(address));
                live.remove(address);
            }
            assert_eq!(
                endpoints.addresses().map(str::to_string).collect::<BTreeSet<_>>(),
                live
            );
        }
    }

    #[rstest]
    #[case("grpc:svc/malformed-key")]
    #[case("grpc:svc/")]
    #[case("grpc:svc/nested/10.0.0.1:80")]
    #[case("grpc:other/10.0.0.1:80")]
    fn test_non_service_keys_ignored(#[case] key: &str) {
        let mut endpoints = Endpoints::new();
        endpoints.apply(PREFIX, &put("a:1"));
        let before = endpoints.clone();

        let event = WatchEvent {
            kind: WatchEventKind::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: b"garbage".to_vec(),
                mod_revision: 3,
                lease: 0,
            },
        };
        assert!(!endpoints.apply(PREFIX, &event));
        assert_eq!(endpoints, before);
    }

    #[test]
    fn test_malformed_value_skipped() {
        let mut endpoints = Endpoints::new();
        let mut event = put("a:1");
        event.kv.value = b"{not json".to_vec();
        assert!(!endpoints.apply(PREFIX, &event));
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_delete_of_unknown_address_is_harmless() {
        let mut endpoints = Endpoints::new();
        endpoints.apply(PREFIX, &put("b:1"));
        endpoints.apply(PREFIX, &delete("a:1"));
        assert!(endpoints.contains("b:1"));
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn test_reconcile_prunes_and_upserts() {
        let mut endpoints = Endpoints::new();
        endpoints.apply(PREFIX, &put("a:1"));
        endpoints.apply(PREFIX, &put("b:1"));

        let listing = vec![put("b:1").kv, put("c:1").kv];
        assert!(endpoints.reconcile(PREFIX, &listing));
        assert_eq!(
            endpoints.addresses().collect::<Vec<_>>(),
            vec!["b:1", "c:1"]
        );
        assert!(!endpoints.reconcile(PREFIX, &listing));
    }
}
