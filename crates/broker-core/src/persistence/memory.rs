// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence, for tests and embedded use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::instance::{FailureKind, InstanceRecord};

use super::{InProgressBatch, Persistence, due_key};

/// Records kept in a process-local map.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    records: Arc<RwLock<HashMap<String, InstanceRecord>>>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn insert(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.instance_id) {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: record.instance_id.clone(),
            });
        }
        records.insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        Ok(self.records.read().await.get(instance_id).cloned())
    }

    async fn save(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.instance_id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(CoreError::InstanceNotFound {
                instance_id: record.instance_id.clone(),
            }),
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError> {
        Ok(self.records.write().await.remove(instance_id).is_some())
    }

    async fn list_in_progress(&self, limit: i64) -> Result<InProgressBatch, CoreError> {
        let records = self.records.read().await;
        let mut pending: Vec<InstanceRecord> = records
            .values()
            .filter(|r| r.is_in_progress())
            .cloned()
            .collect();
        pending.sort_by_key(due_key);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(InProgressBatch {
            records: pending,
            unreadable: Vec::new(),
        })
    }

    async fn quarantine(&self, instance_id: &str, reason: &str) -> Result<bool, CoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(instance_id) else {
            return Ok(false);
        };
        record.mark_failed(FailureKind::CorruptState, reason.to_string());
        record.updated_at = chrono::Utc::now();
        Ok(true)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
