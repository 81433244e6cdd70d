// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template deployment driving shared by the service modules.

use broker_core::{StepContext, StepError, StepOutcome};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::backend::{ArmDeployer, DeploymentRequest, DeploymentState};

/// Where a deployment stands after one step invocation.
pub(crate) enum DeploymentProgress {
    /// Still running; return this outcome from the step.
    Running(StepOutcome),
    /// Finished with these template outputs.
    Finished(Map<String, Value>),
}

/// Submit the deployment on first invocation, then check on it.
///
/// The deployment name doubles as the operation token, so a resumed step
/// only polls and never submits twice.
pub(crate) async fn drive_deployment(
    arm: &dyn ArmDeployer,
    ctx: &StepContext,
    request: DeploymentRequest,
) -> Result<DeploymentProgress, StepError> {
    if ctx.is_resume() {
        debug!(
            instance_id = %ctx.instance_id,
            deployment = %request.name,
            attempt = ctx.attempt,
            "Checking deployment"
        );
    } else {
        arm.deploy(&request, ctx.cancellation()).await?;
        info!(
            instance_id = %ctx.instance_id,
            deployment = %request.name,
            resource_group = %request.resource_group,
            "Deployment submitted"
        );
    }

    match arm
        .status(&request.name, &request.resource_group, ctx.cancellation())
        .await?
    {
        DeploymentState::Running => Ok(DeploymentProgress::Running(StepOutcome::in_progress(
            request.name,
        ))),
        DeploymentState::Succeeded { outputs } => Ok(DeploymentProgress::Finished(outputs)),
        DeploymentState::Failed { reason } => Err(StepError::hard(format!(
            "deployment '{}' failed: {}",
            request.name, reason
        ))),
    }
}

/// Delete a deployment record; the resources it created stay.
pub(crate) async fn delete_deployment(
    arm: &dyn ArmDeployer,
    ctx: &StepContext,
    name: &str,
    resource_group: &str,
) -> Result<(), StepError> {
    if name.is_empty() {
        return Ok(());
    }
    arm.delete(name, resource_group, ctx.cancellation()).await?;
    info!(instance_id = %ctx.instance_id, deployment = %name, "Deployment deleted");
    Ok(())
}
