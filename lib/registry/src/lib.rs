// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamic service discovery for RPC clients.
//!
//! Services register themselves in a shared directory under a TTL lease that
//! is kept alive in the background; clients watch a service prefix and keep a
//! live snapshot of healthy endpoints, which is bridged into a flat address
//! list and consumed by a smooth weighted round-robin picker.
//!
//! ```text
//! Directory ──watch──► EndpointSynchronizer ──Endpoints──► Resolver ──addresses──► Balancer ──► call
//!     ▲
//!     └──put/lease── LeaseRegistry ◄── ServiceInfo
//! ```
//!
//! # Example
//!
//! ```no_run
//! use meridian_registry::directory::MemoryDirectory;
//! use meridian_registry::registry::{LeaseRegistry, Registry};
//! use meridian_registry::config::EtcdRegistryConfig;
//! use meridian_registry::ServiceInfo;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let directory = Arc::new(MemoryDirectory::new());
//! let registry = LeaseRegistry::new(directory, EtcdRegistryConfig::default())?;
//!
//! let info = ServiceInfo::builder()
//!     .name("greeter")
//!     .scheme("grpc")
//!     .address("10.0.0.1:9000")
//!     .build()?;
//! registry.register_service(&info).await?;
//!
//! let mut endpoints = registry.watch_services("grpc:greeter/").await?;
//! let snapshot = endpoints.recv().await.expect("initial snapshot");
//! assert!(snapshot.contains("10.0.0.1:9000"));
//!
//! registry.close().await?;
//! # Ok(())
//! # }
//! ```

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod balancer;
pub mod config;
pub mod directory;
pub mod endpoints;
pub mod error;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod synchronizer;
pub mod utils;

pub use endpoints::Endpoints;
pub use registry::{LeaseRegistry, LocalRegistry, Registry, RegistryHandle};
pub use service::ServiceInfo;
pub use tokio_util::sync::CancellationToken;
