// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from `MERIDIAN_CONFIG_PATH`
//! 3. Environment variables (`MERIDIAN_` prefixed, `__` separated)
//!
//! ```toml
//! [registry.primary]
//! kind = "etcdv3"
//! endpoints = ["http://etcd-0:2379", "http://etcd-1:2379"]
//! service_ttl_secs = 30
//!
//! [registry.fallback]
//! kind = "local"
//! ```

use derive_builder::Builder;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::registry::{KIND_ETCD, KIND_LOCAL, LocalRegistry, Registry};
use crate::{Result, raise};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Settings of the lease-backed registry and the etcd connection under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct EtcdRegistryConfig {
    /// Etcd endpoints (default: ["http://localhost:2379"]).
    #[serde(default = "default_endpoints")]
    #[builder(default = "default_endpoints()")]
    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    /// Connection timeout in seconds (default: 5).
    #[serde(default = "default_connect_timeout")]
    #[builder(default = "default_connect_timeout()")]
    pub connect_timeout_secs: u64,

    /// Deadline for reads and unregistration in milliseconds (default: 3000).
    #[serde(default = "default_read_timeout")]
    #[builder(default = "default_read_timeout()")]
    pub read_timeout_ms: u64,

    /// Lease TTL in seconds (default: 60). Zero disables leasing; keys are
    /// then written without a lease and never expire.
    #[serde(default = "default_service_ttl")]
    #[builder(default = "default_service_ttl()")]
    pub service_ttl_secs: u64,

    /// Bound on one re-registration pass in milliseconds (default: 5000).
    #[serde(default = "default_register_timeout")]
    #[builder(default = "default_register_timeout()")]
    #[validate(range(min = 1))]
    pub register_timeout_ms: u64,

    /// Attempts per key during re-registration (default: 3, range: 1-10).
    #[serde(default = "default_retry_times")]
    #[builder(default = "default_retry_times()")]
    #[validate(range(min = 1, max = 10))]
    pub retry_times: u32,

    /// Pause between re-registration attempts in milliseconds (default: 1000).
    #[serde(default = "default_retry_interval")]
    #[builder(default = "default_retry_interval()")]
    pub retry_interval_ms: u64,

    /// Pause before a broken watch is re-established in milliseconds
    /// (default: 1000).
    #[serde(default = "default_watch_backoff")]
    #[builder(default = "default_watch_backoff()")]
    pub watch_backoff_ms: u64,

    /// Capacity of each endpoint snapshot channel (default: 10).
    #[serde(default = "default_watch_buffer")]
    #[builder(default = "default_watch_buffer()")]
    #[validate(range(min = 1))]
    pub watch_buffer: usize,

    #[serde(default)]
    #[builder(setter(into, strip_option), default)]
    pub username: Option<String>,

    #[serde(default)]
    #[builder(setter(into, strip_option), default)]
    pub password: Option<String>,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://localhost:2379".to_string()]
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    3000
}

fn default_service_ttl() -> u64 {
    60
}

fn default_register_timeout() -> u64 {
    5000
}

fn default_retry_times() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_watch_backoff() -> u64 {
    1000
}

fn default_watch_buffer() -> usize {
    10
}

impl Default for EtcdRegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            service_ttl_secs: default_service_ttl(),
            register_timeout_ms: default_register_timeout(),
            retry_times: default_retry_times(),
            retry_interval_ms: default_retry_interval(),
            watch_backoff_ms: default_watch_backoff(),
            watch_buffer: default_watch_buffer(),
            username: None,
            password: None,
        }
    }
}

impl EtcdRegistryConfigBuilder {
    /// Build and validate the configuration.
    pub fn build(self) -> std::result::Result<EtcdRegistryConfig, ConfigError> {
        let config = self
            .build_internal()
            .map_err(|e| ConfigError::Other(anyhow::anyhow!("Failed to build config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

impl EtcdRegistryConfig {
    pub fn builder() -> EtcdRegistryConfigBuilder {
        EtcdRegistryConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Lease TTL, `None` when leasing is disabled.
    pub fn service_ttl(&self) -> Option<Duration> {
        (self.service_ttl_secs > 0).then(|| Duration::from_secs(self.service_ttl_secs))
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn watch_backoff(&self) -> Duration {
        Duration::from_millis(self.watch_backoff_ms)
    }
}

/// One named registry entry.
///
/// `kind` selects the backend and defaults to `etcdv3`; the remaining keys
/// configure the etcd backend and are ignored by `local`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RegistryConfig {
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub etcd: EtcdRegistryConfig,
}

fn default_kind() -> String {
    KIND_ETCD.to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            etcd: EtcdRegistryConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn local() -> Self {
        Self {
            kind: KIND_LOCAL.to_string(),
            ..Default::default()
        }
    }

    /// Construct the registry this entry describes.
    pub async fn build(&self) -> Result<Arc<dyn Registry>> {
        match self.kind.as_str() {
            KIND_LOCAL => Ok(Arc::new(LocalRegistry::new())),
            KIND_ETCD => self.build_etcd().await,
            other => raise!("unknown registry kind {other:?}"),
        }
    }

    #[cfg(feature = "etcd")]
    async fn build_etcd(&self) -> Result<Arc<dyn Registry>> {
        use crate::directory::EtcdDirectory;
        use crate::registry::LeaseRegistry;

        self.etcd.validate()?;
        let directory = EtcdDirectory::connect(&self.etcd).await?;
        let registry = LeaseRegistry::new(Arc::new(directory), self.etcd.clone())?;
        Ok(Arc::new(registry))
    }

    #[cfg(not(feature = "etcd"))]
    async fn build_etcd(&self) -> Result<Arc<dyn Registry>> {
        raise!("registry kind {KIND_ETCD:?} requires the `etcd` feature")
    }
}

/// All configured registries, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RegistriesConfig {
    #[serde(default)]
    pub registry: BTreeMap<String, RegistryConfig>,
}

impl RegistriesConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("MERIDIAN_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RegistriesConfig::default()))
            .merge(Toml::file(&config_path))
            // MERIDIAN_REGISTRY__PRIMARY__ENDPOINTS, MERIDIAN_REGISTRY__PRIMARY__KIND, ...
            .merge(Env::prefixed("MERIDIAN_").split("__"))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// Entries are not validated here; an invalid entry is reported when it
    /// is built and does not prevent the others from loading.
    pub fn extract_from<T: Provider>(provider: T) -> std::result::Result<Self, ConfigError> {
        Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))
    }
}
