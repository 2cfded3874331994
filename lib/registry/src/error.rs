// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry error taxonomy.
//!
//! Synchronous operations (register, unregister, get, list) surface these to
//! the caller, usually wrapped in an [`anyhow::Error`]. Background loops never
//! return them; they log and recover instead.
//!
//! - [`RegistryError`]: failures of the registration surface
//! - [`PickError`]: per-call picking failures, always retryable
//!
//! Directory-level failures live in [`crate::directory::DirectoryError`].

use std::time::Duration;

// ============================================================================
// RegistryError
// ============================================================================

/// Failures returned by [`crate::registry::Registry`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No value stored under the requested key.
    #[error("service not found: {0}")]
    NotFound(String),

    /// The service description cannot be registered as-is.
    #[error("invalid service info: {0}")]
    InvalidServiceInfo(String),

    /// The backend does not implement this operation.
    #[error("{op} is not supported by the {kind} registry")]
    Unsupported { kind: &'static str, op: &'static str },

    /// The registry was closed and no longer accepts registrations.
    #[error("registry is closed")]
    Closed,

    /// A directory call did not complete within its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

// ============================================================================
// PickError
// ============================================================================

/// Failures returned by [`crate::balancer::SwrPicker::pick`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickError {
    /// The bucket is empty because no connection is ready.
    #[error("no connections available")]
    NoConnectionsAvailable,
}

impl PickError {
    /// Pick failures reflect a transient connection state; the connection
    /// management layer should wait for a new picker and retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PickError::NoConnectionsAvailable => true,
        }
    }
}
