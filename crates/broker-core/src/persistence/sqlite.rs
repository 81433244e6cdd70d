// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::warn;

use crate::error::CoreError;
use crate::instance::{
    DetailBag, FailureKind, InstanceRecord, InstanceStatus, LifecycleOperation, SecureDetailBag,
};
use crate::secrets::SecretCipher;

use super::{InProgressBatch, Persistence, UnreadableRecord};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_COLUMNS: &str = r#"
    SELECT instance_id, service_id, plan_id, location, resource_group, parameters,
           status, operation, step_index, details, secure_details,
           operation_token, operation_deadline, next_poll_at, poll_attempts,
           status_reason, failure_kind, created_at, updated_at
    FROM service_instances
"#;

/// SQLite-backed persistence provider.
///
/// Sensitive details are sealed with the configured [`SecretCipher`] before
/// they reach the database and live in their own column.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    cipher: SecretCipher,
}

impl std::fmt::Debug for SqlitePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePersistence")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an already migrated pool.
    pub fn new(pool: SqlitePool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/broker.db", cipher).await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>, cipher: SecretCipher) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool, cipher })
    }

    /// Create a migrated in-memory database on a single connection.
    pub async fn in_memory(cipher: SecretCipher) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool, cipher })
    }

    /// Run the embedded migrations against a pool.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn seal(&self, bag: &SecureDetailBag) -> Result<Option<Vec<u8>>, CoreError> {
        if bag.is_empty() {
            return Ok(None);
        }
        self.cipher.seal(bag).map(Some)
    }

    fn decode(&self, row: InstanceRow) -> Result<InstanceRecord, CoreError> {
        let status = InstanceStatus::parse(&row.status).ok_or_else(|| {
            CoreError::corrupt(format!(
                "instance '{}' has unknown status '{}'",
                row.instance_id, row.status
            ))
        })?;
        let operation = row
            .operation
            .as_deref()
            .map(|op| {
                LifecycleOperation::parse(op).ok_or_else(|| {
                    CoreError::corrupt(format!(
                        "instance '{}' has unknown operation '{}'",
                        row.instance_id, op
                    ))
                })
            })
            .transpose()?;
        let failure_kind = row
            .failure_kind
            .as_deref()
            .map(|kind| {
                FailureKind::parse(kind).ok_or_else(|| {
                    CoreError::corrupt(format!(
                        "instance '{}' has unknown failure kind '{}'",
                        row.instance_id, kind
                    ))
                })
            })
            .transpose()?;

        let parameters: Map<String, Value> =
            stored_json(&row.instance_id, "parameters", &row.parameters)?;
        let details: DetailBag = stored_json(&row.instance_id, "details", &row.details)?;
        let secure_details = match row.secure_details.as_deref() {
            Some(sealed) => self.cipher.open(sealed).map_err(|e| {
                CoreError::corrupt(format!(
                    "instance '{}' has unreadable secure details: {}",
                    row.instance_id, e
                ))
            })?,
            None => SecureDetailBag::empty(),
        };

        Ok(InstanceRecord {
            instance_id: row.instance_id,
            service_id: row.service_id,
            plan_id: row.plan_id,
            location: row.location,
            resource_group: row.resource_group,
            parameters,
            status,
            operation,
            step_index: usize::try_from(row.step_index).unwrap_or(0),
            details,
            secure_details,
            operation_token: row.operation_token,
            operation_deadline: row.operation_deadline,
            next_poll_at: row.next_poll_at,
            poll_attempts: u32::try_from(row.poll_attempts).unwrap_or(u32::MAX),
            status_reason: row.status_reason,
            failure_kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Decode a JSON column. Malformed stored JSON is corrupt state, not a
/// database fault.
fn stored_json<T: serde::de::DeserializeOwned>(
    instance_id: &str,
    column: &str,
    raw: &str,
) -> Result<T, CoreError> {
    serde_json::from_str(raw).map_err(|e| {
        CoreError::corrupt(format!(
            "instance '{}' has malformed {}: {}",
            instance_id, column, e
        ))
    })
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    service_id: String,
    plan_id: String,
    location: String,
    resource_group: String,
    parameters: String,
    status: String,
    operation: Option<String>,
    step_index: i64,
    details: String,
    secure_details: Option<Vec<u8>>,
    operation_token: Option<String>,
    operation_deadline: Option<DateTime<Utc>>,
    next_poll_at: Option<DateTime<Utc>>,
    poll_attempts: i64,
    status_reason: Option<String>,
    failure_kind: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn insert(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let secure = self.seal(&record.secure_details)?;
        let result = sqlx::query(
            r#"
            INSERT INTO service_instances (
                instance_id, service_id, plan_id, location, resource_group, parameters,
                status, operation, step_index, details, secure_details,
                operation_token, operation_deadline, next_poll_at, poll_attempts,
                status_reason, failure_kind, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (instance_id) DO NOTHING
            "#,
        )
        .bind(&record.instance_id)
        .bind(&record.service_id)
        .bind(&record.plan_id)
        .bind(&record.location)
        .bind(&record.resource_group)
        .bind(serde_json::to_string(&record.parameters)?)
        .bind(record.status.as_str())
        .bind(record.operation.map(|op| op.as_str()))
        .bind(record.step_index as i64)
        .bind(serde_json::to_string(&record.details)?)
        .bind(secure)
        .bind(&record.operation_token)
        .bind(record.operation_deadline)
        .bind(record.next_poll_at)
        .bind(i64::from(record.poll_attempts))
        .bind(&record.status_reason)
        .bind(record.failure_kind.map(|k| k.as_str()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: record.instance_id.clone(),
            });
        }
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let query = format!("{} WHERE instance_id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, InstanceRow>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.decode(row)).transpose()
    }

    async fn save(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let secure = self.seal(&record.secure_details)?;
        let result = sqlx::query(
            r#"
            UPDATE service_instances
            SET location = ?, resource_group = ?, parameters = ?,
                status = ?, operation = ?, step_index = ?, details = ?, secure_details = ?,
                operation_token = ?, operation_deadline = ?, next_poll_at = ?,
                poll_attempts = ?, status_reason = ?, failure_kind = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(&record.location)
        .bind(&record.resource_group)
        .bind(serde_json::to_string(&record.parameters)?)
        .bind(record.status.as_str())
        .bind(record.operation.map(|op| op.as_str()))
        .bind(record.step_index as i64)
        .bind(serde_json::to_string(&record.details)?)
        .bind(secure)
        .bind(&record.operation_token)
        .bind(record.operation_deadline)
        .bind(record.next_poll_at)
        .bind(i64::from(record.poll_attempts))
        .bind(&record.status_reason)
        .bind(record.failure_kind.map(|k| k.as_str()))
        .bind(record.updated_at)
        .bind(&record.instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: record.instance_id.clone(),
            });
        }
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM service_instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_in_progress(&self, limit: i64) -> Result<InProgressBatch, CoreError> {
        // Timestamps are RFC 3339 text of varying width; order on their value.
        let query = format!(
            r#"{} WHERE operation IS NOT NULL
            ORDER BY julianday(COALESCE(next_poll_at, updated_at)) ASC,
                     COALESCE(next_poll_at, updated_at) ASC
            LIMIT ?"#,
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut batch = InProgressBatch::default();
        for row in rows {
            let instance_id = row.instance_id.clone();
            match self.decode(row) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Skipping unreadable instance");
                    batch.unreadable.push(UnreadableRecord {
                        instance_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(batch)
    }

    async fn quarantine(&self, instance_id: &str, reason: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_instances
            SET status = ?, operation = NULL, step_index = 0,
                operation_token = NULL, operation_deadline = NULL, next_poll_at = NULL,
                poll_attempts = 0, status_reason = ?, failure_kind = ?, updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(InstanceStatus::Failed.as_str())
        .bind(reason)
        .bind(FailureKind::CorruptState.as_str())
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
