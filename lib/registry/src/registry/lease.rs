// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The single lease held by a registry.

use parking_lot::RwLock;
use std::time::Duration;

use crate::Result;
use crate::directory::{Directory, LeaseId};

/// Current lease handle of one registry. Zero means no lease is held.
///
/// Reads take the read lock; grants and invalidations take the write lock
/// only for the field update, never across a directory call. Grants are
/// serialized so concurrent registrations share one lease.
#[derive(Debug)]
pub struct LeaseState {
    id: RwLock<LeaseId>,
    grant: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl LeaseState {
    pub fn new(ttl: Duration) -> Self {
        Self {
            id: RwLock::new(0),
            grant: tokio::sync::Mutex::new(()),
            ttl,
        }
    }

    pub fn current(&self) -> LeaseId {
        *self.id.read()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the held lease, granting one if none is held.
    pub async fn get_or_grant(&self, directory: &dyn Directory) -> Result<LeaseId> {
        let id = self.current();
        if id != 0 {
            return Ok(id);
        }

        let _guard = self.grant.lock().await;
        let id = self.current();
        if id != 0 {
            return Ok(id);
        }

        let id = directory.grant(self.ttl).await?;
        *self.id.write() = id;
        tracing::debug!(lease_id = %format!("{id:x}"), ttl = ?self.ttl, "lease granted");
        Ok(id)
    }

    /// Drop `expected` if it is still the held lease. Returns whether the
    /// lease was dropped; a lease replaced in the meantime is left alone.
    pub fn invalidate(&self, expected: LeaseId) -> bool {
        let mut id = self.id.write();
        if expected != 0 && *id == expected {
            *id = 0;
            true
        } else {
            false
        }
    }
}
