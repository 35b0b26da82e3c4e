// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide rate-limit gate.
//!
//! Any component that observes a rate-limit response pushes the shared
//! deadline forward; every outbound network caller consults the deadline
//! before issuing a request. Recovery is jittered so the workers do not all
//! resume in the same instant.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::debug;

/// Maximum random jitter added after a backoff window ends.
const RESUME_JITTER_MS: u64 = 2_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Shared backoff deadline, millisecond epoch. The deadline only ever moves
/// forward; see [`SharedBackoff::trigger`].
#[derive(Debug, Default)]
pub struct SharedBackoff {
    deadline_ms: AtomicI64,
}

impl SharedBackoff {
    pub fn new() -> Self {
        Self {
            deadline_ms: AtomicI64::new(0),
        }
    }

    /// Push the deadline to at least `now + retry_after`. Monotone: a trigger
    /// never moves an already-later deadline earlier.
    pub fn trigger(&self, retry_after: Duration) {
        let candidate = now_ms().saturating_add(retry_after.as_millis() as i64);
        let previous = self.deadline_ms.fetch_max(candidate, Ordering::SeqCst);
        if candidate > previous {
            debug!(
                "[BACKOFF] Deadline pushed {}ms forward",
                candidate - previous.max(now_ms())
            );
        }
    }

    /// Block until the deadline has passed. If any waiting was needed, an
    /// additional 0-2s random sleep spreads out the recovering callers.
    pub async fn wait(&self) {
        let mut waited = false;
        loop {
            let remaining = self.deadline_ms.load(Ordering::SeqCst) - now_ms();
            if remaining <= 0 {
                break;
            }
            waited = true;
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
        if waited {
            let jitter = rand::thread_rng().gen_range(0..=RESUME_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms.load(Ordering::SeqCst)
    }
}
