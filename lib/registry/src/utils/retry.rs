// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use crate::Result;

/// Run `op` up to `attempts` times, sleeping `interval` between failures.
///
/// Returns the first success, or the last error once attempts are exhausted.
/// `attempts` of zero is treated as one.
pub async fn retry<T, F, Fut>(attempts: u32, interval: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, attempts, error = %e, "retrying after failure");
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}
