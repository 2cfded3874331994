// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Service instance description and its directory key.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;
use crate::error::RegistryError;

/// One registered instance of a logical service.
///
/// Constructed once by the owning service at startup and immutable
/// thereafter. Stored as JSON under [`ServiceInfo::registry_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct ServiceInfo {
    /// Opaque instance identifier, e.g. `worker-5f2c...`.
    #[builder(setter(into), default = "uuid::Uuid::new_v4().to_string()")]
    #[serde(default)]
    pub id: String,

    /// Logical service name, e.g. `worker`.
    #[builder(setter(into))]
    pub name: String,

    /// Protocol tag, e.g. `grpc` or `http`.
    #[builder(setter(into), default)]
    #[serde(default)]
    pub scheme: String,

    /// `host:port` the instance serves on.
    #[builder(setter(into))]
    pub address: String,

    #[builder(setter(into), default)]
    #[serde(default)]
    pub hostname: String,

    #[builder(setter(custom), default)]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInfoBuilder {
    /// Add a single metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(name) = &self.name
            && name.is_empty()
        {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }
}

impl ServiceInfo {
    pub fn builder() -> ServiceInfoBuilder {
        ServiceInfoBuilder::default()
    }

    /// Directory key for this instance: `scheme:name/address`.
    pub fn registry_key(&self) -> String {
        format!("{}:{}/{}", self.scheme, self.name, self.address)
    }

    /// Prefix under which every instance of this service is registered.
    pub fn service_prefix(&self) -> String {
        format!("{}:{}/", self.scheme, self.name)
    }

    /// Instances are the same when name and address match, regardless of
    /// metadata.
    pub fn same_instance(&self, other: &ServiceInfo) -> bool {
        self.name == other.name && self.address == other.address
    }

    /// Whether the address is a syntactically valid `host:port`.
    pub fn is_routable(&self) -> bool {
        is_host_port(&self.address)
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn from_json(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    pub(crate) fn ensure_routable(&self) -> Result<()> {
        if !self.is_routable() {
            return Err(RegistryError::InvalidServiceInfo(format!(
                "address {:?} is not a valid host:port",
                self.address
            ))
            .into());
        }
        Ok(())
    }
}

/// Split `host:port` or `[v6-host]:port` into its parts.
///
/// The host must be non-empty, contain no `/`, and contain no `:` unless
/// bracketed; the port must be a decimal `u16`.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() || host.contains('/') || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((host, port.parse().ok()?))
}

pub fn is_host_port(addr: &str) -> bool {
    split_host_port(addr).is_some()
}
