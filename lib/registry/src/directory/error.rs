// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error classification for directory operations.
//!
//! Separates conditions a background loop should recover from (lost
//! connection, compacted history, vanished lease) from fatal ones.

use super::LeaseId;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The requested start revision was compacted away; the watch must be
    /// restarted from the current state.
    #[error("required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: i64 },

    /// Connection or transport failure; retry after reconnecting.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// The lease expired or was revoked.
    #[error("lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    /// Any other backend failure.
    #[error("directory backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl DirectoryError {
    /// Whether retrying after a backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::Compacted { .. }
                | DirectoryError::Unavailable(_)
                | DirectoryError::LeaseNotFound(_)
        )
    }
}

/// Whether `err` wraps a [`DirectoryError`] that a retry may cure. Errors of
/// any other type are treated as fatal.
pub(crate) fn is_transient_error(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<DirectoryError>())
        .is_some_and(DirectoryError::is_transient)
}

/// Classify a backend error message.
///
/// Backends such as `etcd-client` do not expose structured error kinds, so
/// the classification matches on the lowercased message.
pub(crate) fn classify_message(message: &str, lease: Option<LeaseId>) -> Option<DirectoryError> {
    let msg = message.to_lowercase();

    if msg.contains("unavailable")
        || msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("connection closed")
        || msg.contains("broken pipe")
        || msg.contains("not connected")
        || msg.contains("stream closed")
        || msg.contains("channel closed")
        || msg.contains("timeout")
        || msg.contains("deadline exceeded")
    {
        return Some(DirectoryError::Unavailable(message.to_string()));
    }

    if msg.contains("lease not found") {
        return Some(DirectoryError::LeaseNotFound(lease.unwrap_or_default()));
    }

    if msg.contains("compacted") {
        return Some(DirectoryError::Compacted {
            compact_revision: 0,
        });
    }

    None
}
