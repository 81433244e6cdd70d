// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steps: the unit of backend interaction within a sequence.
//!
//! A step receives a snapshot of the instance and returns either its final
//! output or an "in progress" marker carrying a backend token. Steps keep no
//! state between invocations; the executor persists everything they return.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::instance::{DetailBag, InstanceRecord, SecureDetailBag};

/// Result type returned by steps.
pub type StepResult = std::result::Result<StepOutcome, StepError>;

/// Detail updates produced by a completed step.
///
/// `None` leaves the corresponding bag untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Non-sensitive fields to merge.
    pub details: Option<DetailBag>,
    /// Sensitive fields to merge.
    pub secure_details: Option<SecureDetailBag>,
}

impl StepOutput {
    /// Output that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set non-sensitive fields.
    pub fn with_details(mut self, details: DetailBag) -> Self {
        self.details = Some(details);
        self
    }

    /// Set sensitive fields.
    pub fn with_secure(mut self, secure: SecureDetailBag) -> Self {
        self.secure_details = Some(secure);
        self
    }
}

/// What a step invocation achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished; merge the output and move on.
    Complete(StepOutput),
    /// The backend accepted the request but has not finished it.
    InProgress {
        /// Opaque backend token handed back on the next invocation.
        token: String,
        /// Earliest sensible time to check again (overrides backoff).
        retry_after: Option<Duration>,
        /// How long to keep waiting before failing with a timeout.
        max_wait: Option<Duration>,
    },
}

impl StepOutcome {
    /// Completed without detail changes.
    pub fn done() -> Self {
        Self::Complete(StepOutput::new())
    }

    /// Still running with the given backend token.
    pub fn in_progress(token: impl Into<String>) -> Self {
        Self::InProgress {
            token: token.into(),
            retry_after: None,
            max_wait: None,
        }
    }
}

/// Per-invocation context handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Instance being driven.
    pub instance_id: String,
    /// Token from a previous `InProgress` result of this same step.
    pub operation_token: Option<String>,
    /// 1-based invocation count of this step within the current operation.
    pub attempt: u32,
    cancel: CancellationToken,
}

impl StepContext {
    /// Create a context.
    pub fn new(
        instance_id: impl Into<String>,
        operation_token: Option<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            operation_token,
            attempt,
            cancel,
        }
    }

    /// Token to pass to cancellable backend calls.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True when resuming a step that previously reported `InProgress`.
    pub fn is_resume(&self) -> bool {
        self.operation_token.is_some()
    }
}

/// One named unit of work in a step sequence.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used for logs and as the resume marker.
    fn name(&self) -> &str;

    /// Perform the step against the backend.
    async fn execute(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult;
}

/// Step backed by an async closure.
pub struct FnStep<F> {
    name: String,
    run: F,
}

impl<F> fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

/// Build a step from a name and an async closure.
///
/// ```ignore
/// let step = step_fn("deleteARMDeployment", move |ctx, instance| {
///     let module = module.clone();
///     async move { module.delete_arm_deployment(ctx, instance).await }
/// });
/// ```
pub fn step_fn<F, Fut>(name: impl Into<String>, run: F) -> FnStep<F>
where
    F: Fn(StepContext, InstanceRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    FnStep {
        name: name.into(),
        run,
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext, InstanceRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        (self.run)(ctx, instance).await
    }
}
