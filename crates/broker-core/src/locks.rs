// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance single-flight locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by instance ID.
///
/// A guard is held for the duration of one step, never a whole sequence.
#[derive(Debug, Default, Clone)]
pub struct InstanceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one instance.
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of tracked instance IDs.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no instance ID is tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
