// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridges endpoint snapshots into the address list of an RPC client's
//! connection manager.
//!
//! A [`Resolver`] watches the service prefix named by a [`Target`] and, for
//! every snapshot, pushes the complete current address list through
//! [`ClientConn::update_state`]. Consumers replace their state; there are no
//! deltas.

use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::{Endpoints, ErrorContext, Result, ServiceInfo, raise};

/// Parsed dial target: `scheme://authority/endpoint`.
///
/// The endpoint names the watched service, e.g. `grpc:greeter` in
/// `etcdv3:///grpc:greeter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    /// Prefix watched for this target; always ends in `/`.
    pub fn watch_prefix(&self) -> String {
        if self.endpoint.ends_with('/') {
            self.endpoint.clone()
        } else {
            format!("{}/", self.endpoint)
        }
    }
}

impl FromStr for Target {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((scheme, rest)) = s.split_once("://") else {
            raise!("target {s:?} is not of the form scheme://authority/endpoint");
        };
        let (authority, endpoint) = rest.split_once('/').unwrap_or(("", rest));
        if scheme.is_empty() || endpoint.is_empty() {
            raise!("target {s:?} is missing a scheme or endpoint");
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

/// One resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// `host:port` to dial.
    pub addr: String,
    /// Name used for authority and TLS verification: the watched prefix.
    pub server_name: String,
    /// The registered instance behind the address.
    pub attributes: ServiceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

impl ResolverState {
    fn from_endpoints(server_name: &str, endpoints: &Endpoints) -> Self {
        Self {
            addresses: endpoints
                .iter()
                .map(|(addr, info)| Address {
                    addr: addr.to_string(),
                    server_name: server_name.to_string(),
                    attributes: info.clone(),
                })
                .collect(),
        }
    }
}

/// The connection manager a resolver reports to.
pub trait ClientConn: Send + Sync {
    /// Replace the resolved address list.
    fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// Creates resolvers backed by a [`Registry`].
#[derive(Debug, Clone)]
pub struct ResolverBuilder {
    registry: Arc<dyn Registry>,
}

impl ResolverBuilder {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Target scheme this builder serves: the registry kind.
    pub fn scheme(&self) -> &'static str {
        self.registry.kind()
    }

    /// Start resolving `target` into `conn`.
    ///
    /// Fails if the initial watch cannot be established. Later failures are
    /// logged and the last good list stays in effect.
    pub async fn build(&self, target: &Target, conn: Arc<dyn ClientConn>) -> Result<Resolver> {
        let prefix = target.watch_prefix();
        let mut snapshots = self
            .registry
            .watch_services(&prefix)
            .await
            .with_context(|| format!("failed to resolve {target}"))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let server_name = prefix.clone();

        let handle = tokio::spawn(async move {
            loop {
                let endpoints = tokio::select! {
                    _ = token.cancelled() => break,
                    next = snapshots.recv() => match next {
                        Some(endpoints) => endpoints,
                        None => {
                            tracing::debug!(prefix = %prefix, "endpoint stream closed; resolver idle");
                            break;
                        }
                    },
                };

                let state = ResolverState::from_endpoints(&server_name, &endpoints);
                let count = state.addresses.len();
                match conn.update_state(state) {
                    Ok(()) => tracing::debug!(prefix = %prefix, count, "resolver state updated"),
                    Err(e) => tracing::warn!(prefix = %prefix, error = %e, "failed to update resolver state"),
                }
            }
        });

        Ok(Resolver {
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// A running resolution. Dropping it stops the watch without waiting.
pub struct Resolver {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// Refresh hint. Updates are pushed as they happen, so this does nothing.
    pub fn resolve_now(&self) {}

    /// Stop watching and wait for the bridging task to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "resolver task failed");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("etcdv3:///grpc:greeter", "etcdv3", "", "grpc:greeter/")]
    #[case("etcdv3://cluster-a/grpc:greeter/", "etcdv3", "cluster-a", "grpc:greeter/")]
    #[case("local://grpc:greeter", "local", "", "grpc:greeter/")]
    fn test_target_parse(
        #[case] raw: &str,
        #[case] scheme: &str,
        #[case] authority: &str,
        #[case] prefix: &str,
    ) {
        let target: Target = raw.parse().unwrap();
        assert_eq!(target.scheme, scheme);
        assert_eq!(target.authority, authority);
        assert_eq!(target.watch_prefix(), prefix);
    }

    #[rstest]
    #[case("grpc:greeter")]
    #[case("etcdv3:///")]
    #[case("://host/grpc:greeter")]
    fn test_target_parse_rejects(#[case] raw: &str) {
        assert!(raw.parse::<Target>().is_err());
    }

    #[test]
    fn test_target_display_round_trip() {
        let target: Target = "etcdv3://a/grpc:svc".parse().unwrap();
        assert_eq!(target.to_string(), "etcdv3://a/grpc:svc");
    }
}
