// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Smooth weighted round-robin connection picking.
//!
//! On every pick each candidate's running score grows by its weight; the
//! highest score wins and is lowered by the total weight. Higher weights win
//! proportionally more often, and equal weights rotate without repeats.
//!
//! Pickers are immutable with respect to their candidate set: a change in
//! ready connections builds a new [`SwrPicker`] that is swapped in whole.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PickError;
use crate::resolver::Address;

/// Largest weight a candidate can carry. Larger values are clamped so the
/// running scores stay far from overflow.
pub const MAX_WEIGHT: i64 = 10_000;

#[derive(Debug, Clone)]
struct Weighted<T> {
    item: T,
    weight: i64,
    current: i64,
}

/// One smooth weighted round-robin bucket.
#[derive(Debug, Clone)]
pub struct SmoothWeighted<T> {
    items: Vec<Weighted<T>>,
    total: i64,
}

impl<T> Default for SmoothWeighted<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

impl<T> SmoothWeighted<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate. Weights are clamped to `1..=MAX_WEIGHT`.
    pub fn add(&mut self, item: T, weight: i64) {
        let weight = weight.clamp(1, MAX_WEIGHT);
        self.total = self.total.saturating_add(weight);
        self.items.push(Weighted {
            item,
            weight,
            current: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pick the next candidate; `None` when empty.
    pub fn next(&mut self) -> Option<&T> {
        let mut best: Option<usize> = None;
        let mut best_current = i64::MIN;
        for (idx, candidate) in self.items.iter_mut().enumerate() {
            candidate.current += candidate.weight;
            // ties go to the earliest candidate
            if candidate.current > best_current {
                best = Some(idx);
                best_current = candidate.current;
            }
        }
        let chosen = &mut self.items[best?];
        chosen.current -= self.total;
        Some(&chosen.item)
    }
}

/// Readiness details of one connection.
#[derive(Debug, Clone)]
pub struct SubConnInfo {
    pub address: Address,
}

/// Input to a picker build: the connections that are ready right now.
#[derive(Debug, Clone)]
pub struct PickerBuildInfo<C> {
    pub ready: Vec<(C, SubConnInfo)>,
}

/// Per-call picking input.
#[derive(Debug, Clone)]
pub struct PickInfo {
    /// Full RPC method name, e.g. `/greeter.Greeter/SayHello`.
    pub full_method_name: String,
}

impl PickInfo {
    pub fn new(full_method_name: impl Into<String>) -> Self {
        Self {
            full_method_name: full_method_name.into(),
        }
    }
}

/// Builds [`SwrPicker`]s.
///
/// Weights are uniform unless a metadata key is configured, in which case a
/// positive integer under that key in the instance metadata sets the
/// weight. Routes map a full method name to the host addresses allowed to
/// serve it.
#[derive(Debug, Clone, Default)]
pub struct PickerBuilder {
    weight_key: Option<String>,
    routes: HashMap<String, Vec<String>>,
}

impl PickerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight_key(mut self, key: impl Into<String>) -> Self {
        self.weight_key = Some(key.into());
        self
    }

    pub fn route(mut self, full_method_name: impl Into<String>, hosts: Vec<String>) -> Self {
        self.routes.insert(full_method_name.into(), hosts);
        self
    }

    fn weight_of(&self, info: &SubConnInfo) -> i64 {
        self.weight_key
            .as_ref()
            .and_then(|key| info.address.attributes.metadata.get(key))
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|weight| *weight > 0)
            .map_or(1, |weight| weight.min(MAX_WEIGHT))
    }

    pub fn build<C: Clone>(&self, info: PickerBuildInfo<C>) -> SwrPicker<C> {
        let mut global = SmoothWeighted::new();
        for (conn, sub) in &info.ready {
            global.add(conn.clone(), self.weight_of(sub));
        }

        let mut routes = HashMap::with_capacity(self.routes.len());
        for (method, hosts) in &self.routes {
            let mut bucket = SmoothWeighted::new();
            for (conn, sub) in &info.ready {
                if hosts.iter().any(|host| *host == sub.address.addr) {
                    bucket.add(conn.clone(), self.weight_of(sub));
                }
            }
            routes.insert(method.clone(), bucket);
        }

        tracing::debug!(
            ready = info.ready.len(),
            routes = routes.len(),
            "built weighted picker"
        );

        SwrPicker {
            buckets: Mutex::new(Buckets { global, routes }),
        }
    }
}

#[derive(Debug)]
struct Buckets<C> {
    global: SmoothWeighted<C>,
    routes: HashMap<String, SmoothWeighted<C>>,
}

/// Picks a connection per call from a fixed candidate set.
#[derive(Debug)]
pub struct SwrPicker<C> {
    buckets: Mutex<Buckets<C>>,
}

impl<C: Clone> SwrPicker<C> {
    /// Picker with no candidates; every pick fails.
    pub fn empty() -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                global: SmoothWeighted::new(),
                routes: HashMap::new(),
            }),
        }
    }

    /// Pick from the route bucket of the call's method, or from the global
    /// bucket when the method has no route or its route bucket is empty.
    pub fn pick(&self, info: &PickInfo) -> Result<C, PickError> {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.routes.get_mut(&info.full_method_name)
            && let Some(conn) = bucket.next()
        {
            return Ok(conn.clone());
        }
        buckets
            .global
            .next()
            .cloned()
            .ok_or(PickError::NoConnectionsAvailable)
    }
}

/// Keeps the current picker and replaces it when readiness changes.
#[derive(Debug)]
pub struct Balancer<C> {
    builder: PickerBuilder,
    picker: ArcSwap<SwrPicker<C>>,
}

impl<C: Clone> Balancer<C> {
    pub fn new(builder: PickerBuilder) -> Self {
        Self {
            builder,
            picker: ArcSwap::from_pointee(SwrPicker::empty()),
        }
    }

    /// Rebuild the picker from the full set of ready connections.
    pub fn update_ready(&self, ready: Vec<(C, SubConnInfo)>) {
        let picker = self.builder.build(PickerBuildInfo { ready });
        self.picker.store(Arc::new(picker));
    }

    pub fn picker(&self) -> Arc<SwrPicker<C>> {
        self.picker.load_full()
    }

    pub fn pick(&self, info: &PickInfo) -> Result<C, PickError> {
        self.picker.load().pick(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceInfo;
    use std::collections::HashMap;

    fn sub(addr: &str, weight: Option<&str>) -> SubConnInfo {
        let mut builder = ServiceInfo::builder().name("svc").address(addr);
        if let Some(weight) = weight {
            builder = builder.metadata("weight", weight);
        }
        SubConnInfo {
            address: Address {
                addr: addr.to_string(),
                server_name: "svc".to_string(),
                attributes: builder.build().unwrap(),
            },
        }
    }

    fn ready(addrs: &[&str]) -> Vec<(String, SubConnInfo)> {
        addrs
            .iter()
            .map(|addr| (addr.to_string(), sub(addr, None)))
            .collect()
    }

    #[test]
    fn test_smooth_sequence() {
        let mut swr = SmoothWeighted::new();
        swr.add("a", 5);
        swr.add("b", 1);
        swr.add("c", 1);

        let picks: Vec<&str> = (0..7).map(|_| *swr.next().unwrap()).collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_equal_weights_rotate() {
        let picker = PickerBuilder::new().build(PickerBuildInfo {
            ready: ready(&["a:1", "b:1", "c:1"]),
        });
        let info = PickInfo::new("/svc.Svc/Call");

        let picks: Vec<String> = (0..9).map(|_| picker.pick(&info).unwrap()).collect();
        for window in picks.windows(2) {
            assert_ne!(window[0], window[1]);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for pick in picks {
            *counts.entry(pick).or_default() += 1;
        }
        assert!(counts.values().all(|&n| n == 3));
    }

    #[test]
    fn test_empty_picker_is_retryable() {
        let picker: SwrPicker<String> = PickerBuilder::new().build(PickerBuildInfo { ready: vec![] });
        let err = picker.pick(&PickInfo::new("/svc.Svc/Call")).unwrap_err();
        assert_eq!(err, PickError::NoConnectionsAvailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_metadata_weight() {
        let builder = PickerBuilder::new().weight_key("weight");
        let picker = builder.build(PickerBuildInfo {
            ready: vec![
                ("heavy".to_string(), sub("a:1", Some("3"))),
                ("light".to_string(), sub("b:1", Some("not-a-number"))),
            ],
        });
        let info = PickInfo::new("/svc.Svc/Call");
        let heavy = (0..8)
            .filter(|_| picker.pick(&info).unwrap() == "heavy")
            .count();
        assert_eq!(heavy, 6);
    }

    #[test]
    fn test_huge_weight_is_clamped() {
        let builder = PickerBuilder::new().weight_key("weight");
        let picker = builder.build(PickerBuildInfo {
            ready: vec![
                ("heavy".to_string(), sub("a:1", Some(&i64::MAX.to_string()))),
                ("light".to_string(), sub("b:1", Some("1"))),
            ],
        });
        let info = PickInfo::new("/svc.Svc/Call");
        let light = (0..=MAX_WEIGHT)
            .filter(|_| picker.pick(&info).unwrap() == "light")
            .count();
        assert_eq!(light, 1);

        let mut swr = SmoothWeighted::new();
        swr.add("a", i64::MAX);
        swr.add("b", i64::MAX);
        let picks: Vec<&str> = (0..4).map(|_| *swr.next().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_route_bucket_and_fallback() {
        let builder = PickerBuilder::new()
            .route("/svc.Svc/Pinned", vec!["b:1".to_string()])
            .route("/svc.Svc/Orphan", vec!["z:9".to_string()]);
        let picker = builder.build(PickerBuildInfo {
            ready: ready(&["a:1", "b:1"]),
        });

        let pinned = PickInfo::new("/svc.Svc/Pinned");
        for _ in 0..4 {
            assert_eq!(picker.pick(&pinned).unwrap(), "b:1");
        }

        // a route with no ready hosts falls back to the global bucket
        let orphan = PickInfo::new("/svc.Svc/Orphan");
        let mut seen: Vec<String> = (0..2).map(|_| picker.pick(&orphan).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_balancer_swaps_picker() {
        let balancer = Balancer::new(PickerBuilder::new());
        let info = PickInfo::new("/svc.Svc/Call");
        assert!(balancer.pick(&info).is_err());

        balancer.update_ready(ready(&["a:1"]));
        assert_eq!(balancer.pick(&info).unwrap(), "a:1");

        balancer.update_ready(ready(&["b:1"]));
        assert_eq!(balancer.pick(&info).unwrap(), "b:1");

        balancer.update_ready(vec![]);
        assert!(balancer.pick(&info).unwrap_err().is_retryable());
    }
}
