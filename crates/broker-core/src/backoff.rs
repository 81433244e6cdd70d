// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Central retry/poll backoff.

use std::time::Duration;

/// Exponential backoff shared by every service module.
///
/// Used both for re-checking in-progress backend operations and for
/// retrying steps that failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first re-attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the given attempt (1-indexed).
    ///
    /// Attempt 1 waits `initial`, each further attempt doubles it, capped at
    /// `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
        }
    }
}
