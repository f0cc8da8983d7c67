// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential retry backoff for failed run attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff policy: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retrying after `attempt` failed.
    pub fn delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// When to retry, or `None` once the attempt budget is spent.
    pub fn retry_at(
        &self,
        now: DateTime<Utc>,
        attempt: i32,
        max_attempts: i32,
    ) -> Option<DateTime<Utc>> {
        if attempt >= max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        Some(now + delay)
    }
}
