// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for broker-core.
//!
//! The engine only needs whole-record reads and writes. Backends must make
//! `save` atomic per instance: a concurrent `load` never observes a partial
//! write.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::instance::InstanceRecord;

/// Storage of instance records.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a new record. Fails with `InstanceAlreadyExists` if the ID is taken.
    async fn insert(&self, record: &InstanceRecord) -> Result<(), CoreError>;

    /// Load a record by ID.
    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Replace an existing record. Fails with `InstanceNotFound` if it is gone.
    async fn save(&self, record: &InstanceRecord) -> Result<(), CoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// Records with an operation in flight, oldest due first.
    ///
    /// A row that cannot be decoded never fails the batch; it is reported in
    /// [`InProgressBatch::unreadable`] instead.
    async fn list_in_progress(&self, limit: i64) -> Result<InProgressBatch, CoreError>;

    /// Move a record to `failed` with `failure_kind = corrupt_state` without
    /// decoding it. Returns whether the record existed.
    async fn quarantine(&self, instance_id: &str, reason: &str) -> Result<bool, CoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<bool, CoreError>;
}

/// A stored record the backend could not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRecord {
    /// The instance ID of the row.
    pub instance_id: String,
    /// Why decoding failed.
    pub reason: String,
}

/// One page of in-progress records.
#[derive(Debug, Clone, Default)]
pub struct InProgressBatch {
    /// Decoded records, oldest due first.
    pub records: Vec<InstanceRecord>,
    /// Rows that were skipped because they could not be decoded.
    pub unreadable: Vec<UnreadableRecord>,
}

impl InProgressBatch {
    /// Decoded and undecodable rows together.
    pub fn len(&self) -> usize {
        self.records.len() + self.unreadable.len()
    }

    /// True when the page holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordering key used by `list_in_progress`: records never polled come first
/// (by last update), then by due time.
pub(crate) fn due_key(record: &InstanceRecord) -> chrono::DateTime<chrono::Utc> {
    record.next_poll_at.unwrap_or(record.updated_at)
}
