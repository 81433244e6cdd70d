// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow executor.
//!
//! Drives the step sequence of an instance's current operation. Each step is
//! one "read current record, run step, write result" transaction performed
//! under the instance's lock, so:
//!
//! - execution resumes from the persisted `step_index` after a suspension;
//! - an "in progress" result is persisted and returned, never awaited;
//! - a hard error, corrupt state or timeout marks the instance failed before
//!   the error is returned;
//! - cancellation abandons the running step without committing anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::codec::{Credentials, ShapeCodec};
use crate::error::{CoreError, Result, StepError};
use crate::instance::{
    DetailBag, FailureKind, InstanceRecord, InstanceStatus, LifecycleOperation, ProvisionRequest,
    SecureDetailBag,
};
use crate::locks::InstanceLocks;
use crate::persistence::Persistence;
use crate::registry::ServiceRegistry;
use crate::step::{StepContext, StepOutcome, StepOutput};

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum wait assigned to an operation whose step did not specify one.
    pub operation_timeout: Duration,
    /// Delay policy for re-checks and transient retries.
    pub backoff: BackoffPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(1800),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Result of driving an instance.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Snapshot after the last committed step. `None` when the record no
    /// longer exists because a deprovisioning finished.
    pub instance: Option<InstanceRecord>,
    /// False when the sequence is parked on an in-progress backend operation.
    pub done: bool,
}

impl Execution {
    fn finished(instance: Option<InstanceRecord>) -> Self {
        Self {
            instance,
            done: true,
        }
    }
}

enum Progress {
    Advanced(LifecycleOperation),
    Stopped(Execution),
}

/// Runs step sequences against instance records.
pub struct WorkflowExecutor {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ServiceRegistry>,
    locks: InstanceLocks,
    config: ExecutorConfig,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowExecutor {
    /// Create an executor.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<ServiceRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            persistence,
            registry,
            locks: InstanceLocks::new(),
            config,
        }
    }

    /// Service registry in use.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Persistence in use.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Executor settings.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Forget lock entries for instances nobody is executing.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    /// Load the current record of an instance.
    pub async fn instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.persistence.load(instance_id).await
    }

    /// Bind-time credentials of a provisioned instance.
    pub async fn credentials(&self, instance_id: &str) -> Result<Credentials> {
        let record = self.require(instance_id).await?;
        self.registry.credentials(&record)
    }

    /// Create an instance and drive its provisioning sequence.
    ///
    /// Re-delivering the same request for an existing instance of the same
    /// service and plan resumes (or no-ops) instead of failing.
    #[instrument(skip(self, request, cancel), fields(instance_id = %request.instance_id))]
    pub async fn provision(
        &self,
        request: ProvisionRequest,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        self.registry.sequence(
            &request.service_id,
            &request.plan_id,
            LifecycleOperation::Provision,
        )?;
        let record = request.into_record()?;

        match self.persistence.insert(&record).await {
            Ok(()) => {
                info!(
                    service_id = %record.service_id,
                    plan_id = %record.plan_id,
                    "Instance created"
                );
            }
            Err(CoreError::InstanceAlreadyExists { instance_id }) => {
                let existing = self.require(&instance_id).await?;
                if existing.service_id != record.service_id || existing.plan_id != record.plan_id {
                    return Err(CoreError::InstanceAlreadyExists { instance_id });
                }
                debug!("Instance already exists, resuming");
            }
            Err(e) => return Err(e),
        }

        self.execute(&record.instance_id, cancel).await
    }

    /// Start an operation on a stable instance, then drive it.
    pub async fn run(
        &self,
        instance_id: &str,
        operation: LifecycleOperation,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        self.begin(instance_id, operation).await?;
        self.execute(instance_id, cancel).await
    }

    /// Start and drive deprovisioning. A missing record counts as already
    /// deprovisioned.
    pub async fn deprovision(
        &self,
        instance_id: &str,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        match self.begin(instance_id, LifecycleOperation::Deprovision).await {
            Ok(_) => self.execute(instance_id, cancel).await,
            Err(CoreError::InstanceNotFound { .. }) => Ok(Execution::finished(None)),
            Err(e) => Err(e),
        }
    }

    /// Move a stable instance into `operation`'s working status.
    ///
    /// Beginning the operation that is already running is a no-op.
    #[instrument(skip(self, operation), fields(operation = %operation))]
    pub async fn begin(
        &self,
        instance_id: &str,
        operation: LifecycleOperation,
    ) -> Result<InstanceRecord> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut record = self.require(instance_id).await?;

        if record.operation == Some(operation) {
            return Ok(record);
        }
        if record.operation.is_some() || !operation.allowed_from().contains(&record.status) {
            return Err(CoreError::InvalidInstanceState {
                instance_id: instance_id.to_string(),
                expected: operation
                    .allowed_from()
                    .iter()
                    .map(InstanceStatus::as_str)
                    .collect::<Vec<_>>()
                    .join("|"),
                actual: record.status.as_str().to_string(),
            });
        }
        self.registry
            .sequence(&record.service_id, &record.plan_id, operation)?;

        record.status = operation.working_status();
        record.operation = Some(operation);
        record.step_index = 0;
        record.clear_step_bookkeeping();
        record.status_reason = None;
        record.failure_kind = None;
        record.updated_at = Utc::now();
        self.persistence.save(&record).await?;

        info!(status = %record.status, "Operation started");
        Ok(record)
    }

    /// Drive the instance's current operation until it completes, parks on
    /// an in-progress backend operation, or fails.
    ///
    /// Calling this on an instance with no operation in flight returns
    /// `done = true` without running anything.
    #[instrument(skip(self, cancel))]
    pub async fn execute(&self, instance_id: &str, cancel: CancellationToken) -> Result<Execution> {
        let mut last_operation = None;
        loop {
            match self.step_once(instance_id, &cancel, last_operation).await? {
                Progress::Advanced(operation) => last_operation = Some(operation),
                Progress::Stopped(execution) => return Ok(execution),
            }
        }
    }

    /// Fail an instance whose operation deadline has passed.
    ///
    /// Returns false when the instance is gone, idle, or not yet due. An
    /// unreadable record is failed as corrupt state instead.
    pub async fn fail_timeout(&self, instance_id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(instance_id).await;
        let Some(record) = self.load_locked(instance_id).await? else {
            return Ok(false);
        };
        let Some(operation) = record.operation else {
            return Ok(false);
        };
        if !deadline_passed(&record, Utc::now()) {
            return Ok(false);
        }

        let step = self
            .registry
            .sequence(&record.service_id, &record.plan_id, operation)
            .ok()
            .and_then(|seq| seq.step(record.step_index).map(|s| s.name().to_string()))
            .unwrap_or_else(|| format!("#{}", record.step_index));
        self.mark_timed_out(record, &step).await?;
        Ok(true)
    }

    async fn step_once(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
        last_operation: Option<LifecycleOperation>,
    ) -> Result<Progress> {
        let _guard = self.locks.acquire(instance_id).await;

        let Some(mut record) = self.load_locked(instance_id).await? else {
            if last_operation == Some(LifecycleOperation::Deprovision) {
                return Ok(Progress::Stopped(Execution::finished(None)));
            }
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        };
        let Some(operation) = record.operation else {
            return Ok(Progress::Stopped(Execution::finished(Some(record))));
        };

        let sequence = self
            .registry
            .sequence(&record.service_id, &record.plan_id, operation)?;
        let codec = self.registry.codec(&record.service_id)?;

        if let Err(e) = codec.validate(&record.details, &record.secure_details) {
            self.mark_failed(record, FailureKind::CorruptState, e.to_string())
                .await?;
            return Err(e);
        }

        let Some(step) = sequence.step(record.step_index) else {
            return self.finalize(record, operation).await.map(Progress::Stopped);
        };
        let step_name = step.name().to_string();

        let now = Utc::now();
        if deadline_passed(&record, now) {
            return Err(self.mark_timed_out(record, &step_name).await?);
        }

        let ctx = StepContext::new(
            instance_id,
            record.operation_token.clone(),
            record.poll_attempts.saturating_add(1),
            cancel.clone(),
        );
        debug!(step = %step_name, attempt = ctx.attempt, "Running step");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(step = %step_name, "Step abandoned on cancellation");
                return Err(CoreError::Cancelled {
                    instance_id: instance_id.to_string(),
                });
            }
            result = step.execute(ctx, record.clone()) => result,
        };

        let now = Utc::now();
        match result {
            Ok(StepOutcome::Complete(output)) => {
                let (details, secure) = match merge_output(codec, &record, output) {
                    Ok(merged) => merged,
                    Err(e) => {
                        self.mark_failed(
                            record,
                            FailureKind::CorruptState,
                            format!("step '{}' produced incompatible details: {}", step_name, e),
                        )
                        .await?;
                        return Err(e);
                    }
                };
                record.details = details;
                record.secure_details = secure;
                record.step_index += 1;
                record.clear_step_bookkeeping();
                record.status_reason = None;
                info!(step = %step_name, operation = %operation, "Step completed");

                if record.step_index >= sequence.len() {
                    return self.finalize(record, operation).await.map(Progress::Stopped);
                }
                record.updated_at = now;
                self.persistence.save(&record).await?;
                Ok(Progress::Advanced(operation))
            }
            Ok(StepOutcome::InProgress {
                token,
                retry_after,
                max_wait,
            }) => {
                record.operation_token = Some(token);
                if record.operation_deadline.is_none() {
                    record.operation_deadline = Some(after(
                        now,
                        max_wait.unwrap_or(self.config.operation_timeout),
                    ));
                }
                record.poll_attempts = record.poll_attempts.saturating_add(1);
                let delay = retry_after
                    .unwrap_or_else(|| self.config.backoff.delay_for_attempt(record.poll_attempts));
                record.next_poll_at = Some(after(now, delay));
                record.updated_at = now;
                self.persistence.save(&record).await?;

                debug!(
                    step = %step_name,
                    next_poll_at = ?record.next_poll_at,
                    "Step in progress"
                );
                Ok(Progress::Stopped(Execution {
                    instance: Some(record),
                    done: false,
                }))
            }
            Err(StepError::Transient(message)) => {
                record.poll_attempts = record.poll_attempts.saturating_add(1);
                record.next_poll_at = Some(after(
                    now,
                    self.config.backoff.delay_for_attempt(record.poll_attempts),
                ));
                if record.operation_deadline.is_none() {
                    record.operation_deadline = Some(after(now, self.config.operation_timeout));
                }
                record.status_reason =
                    Some(format!("step '{}' will be retried: {}", step_name, message));
                record.updated_at = now;
                self.persistence.save(&record).await?;

                warn!(step = %step_name, error = %message, "Transient step failure");
                Err(CoreError::Transient {
                    instance_id: instance_id.to_string(),
                    step: step_name,
                    message,
                })
            }
            Err(StepError::Hard(message)) => {
                self.mark_failed(
                    record,
                    FailureKind::Backend,
                    format!("step '{}' failed: {}", step_name, message),
                )
                .await?;
                Err(CoreError::StepFailed {
                    instance_id: instance_id.to_string(),
                    step: step_name,
                    message,
                })
            }
            Err(StepError::CorruptState(reason)) => {
                self.mark_failed(
                    record,
                    FailureKind::CorruptState,
                    format!("step '{}' found corrupt state: {}", step_name, reason),
                )
                .await?;
                Err(CoreError::CorruptState { reason })
            }
        }
    }

    async fn finalize(
        &self,
        mut record: InstanceRecord,
        operation: LifecycleOperation,
    ) -> Result<Execution> {
        record.status = operation.terminal_status();
        record.operation = None;
        record.step_index = 0;
        record.clear_step_bookkeeping();
        record.status_reason = None;
        record.failure_kind = None;
        record.updated_at = Utc::now();

        if operation == LifecycleOperation::Deprovision {
            self.persistence.delete(&record.instance_id).await?;
            info!(instance_id = %record.instance_id, "Instance deprovisioned and removed");
        } else {
            self.persistence.save(&record).await?;
            info!(
                instance_id = %record.instance_id,
                status = %record.status,
                "Operation completed"
            );
        }
        Ok(Execution::finished(Some(record)))
    }

    async fn mark_failed(
        &self,
        mut record: InstanceRecord,
        kind: FailureKind,
        reason: String,
    ) -> Result<()> {
        warn!(
            instance_id = %record.instance_id,
            failure_kind = kind.as_str(),
            reason = %reason,
            "Instance failed"
        );
        record.mark_failed(kind, reason);
        record.updated_at = Utc::now();
        self.persistence.save(&record).await
    }

    async fn mark_timed_out(&self, record: InstanceRecord, step: &str) -> Result<CoreError> {
        let instance_id = record.instance_id.clone();
        self.mark_failed(
            record,
            FailureKind::Timeout,
            format!("step '{}' did not complete before its deadline", step),
        )
        .await?;
        Ok(CoreError::Timeout {
            instance_id,
            step: step.to_string(),
        })
    }

    /// Load a record while holding its lock. A record that cannot be decoded
    /// is moved to `failed` in place so it stops being polled.
    async fn load_locked(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        match self.persistence.load(instance_id).await {
            Err(CoreError::CorruptState { reason }) => {
                warn!(
                    instance_id,
                    failure_kind = FailureKind::CorruptState.as_str(),
                    reason = %reason,
                    "Instance record is unreadable"
                );
                self.persistence.quarantine(instance_id, &reason).await?;
                Err(CoreError::CorruptState { reason })
            }
            other => other,
        }
    }

    async fn require(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.persistence
            .load(instance_id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }
}

/// Merge a step's output into copies of the record's bags and re-validate.
fn merge_output(
    codec: &dyn ShapeCodec,
    record: &InstanceRecord,
    output: StepOutput,
) -> Result<(DetailBag, SecureDetailBag)> {
    let mut details = record.details.clone();
    let mut secure = record.secure_details.clone();
    if let Some(update) = output.details {
        details.merge(update)?;
    }
    if let Some(update) = output.secure_details {
        secure.merge(update)?;
    }
    codec.validate(&details, &secure)?;
    Ok((details, secure))
}

pub(crate) fn deadline_passed(record: &InstanceRecord, now: DateTime<Utc>) -> bool {
    record.operation_deadline.is_some_and(|deadline| now >= deadline)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
