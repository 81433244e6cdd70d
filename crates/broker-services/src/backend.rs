// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud backend abstraction used by the service modules.
//!
//! Resource deployment goes through an [`ArmDeployer`]: a template plus
//! parameters is submitted once and then polled until it settles. Resource
//! specific calls that templates cannot express (deleting a service,
//! regenerating keys, creating blob containers) go through small client
//! traits. All of them report [`BackendError`], which converts into the
//! engine's [`StepError`] taxonomy.
//!
//! Every call takes the running step's [`CancellationToken`] and returns
//! [`BackendError::Cancelled`] once it fires.

use std::sync::Arc;

use async_trait::async_trait;
use broker_core::StepError;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors reported by a cloud backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Rate limited by the backend.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Backend temporarily unreachable or returning server errors.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Resource state conflicts with the request (locks, name clashes).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request rejected as malformed or unsupported.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Subscription quota exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller cancelled the request before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl BackendError {
    /// True for failures worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::Unavailable(_) | Self::Cancelled(_)
        )
    }
}

impl From<BackendError> for StepError {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            StepError::Transient(err.to_string())
        } else {
            StepError::Hard(err.to_string())
        }
    }
}

/// A template deployment to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    /// Deployment name, unique within the resource group.
    pub name: String,
    /// Target resource group.
    pub resource_group: String,
    /// Azure region.
    pub location: String,
    /// ARM template body.
    pub template: Value,
    /// Template parameter values.
    pub parameters: Map<String, Value>,
}

/// Observed state of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentState {
    /// Still running.
    Running,
    /// Finished; template outputs by name.
    Succeeded {
        /// Template outputs.
        outputs: Map<String, Value>,
    },
    /// Finished unsuccessfully.
    Failed {
        /// Backend-provided reason.
        reason: String,
    },
}

/// Submits and tracks template deployments.
#[async_trait]
pub trait ArmDeployer: Send + Sync {
    /// Submit a deployment. Submitting a name that already exists is a no-op.
    async fn deploy(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Current state of a submitted deployment.
    async fn status(
        &self,
        name: &str,
        resource_group: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<DeploymentState>;

    /// Delete the deployment record (not the resources it created).
    /// Deleting a missing deployment succeeds.
    async fn delete(
        &self,
        name: &str,
        resource_group: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;
}

/// Search service management.
#[async_trait]
pub trait SearchServicesClient: Send + Sync {
    /// Delete a search service. Deleting a missing service succeeds.
    async fn delete(
        &self,
        resource_group: &str,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;
}

/// Storage account management.
#[async_trait]
pub trait StorageAccountsClient: Send + Sync {
    /// Delete a storage account. Deleting a missing account succeeds.
    async fn delete(
        &self,
        resource_group: &str,
        account_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Regenerate the primary access key and return it.
    async fn regenerate_key(
        &self,
        resource_group: &str,
        account_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<String>;
}

/// Blob container management, authenticated with an account key.
#[async_trait]
pub trait BlobContainersClient: Send + Sync {
    /// Create a container. Creating an existing container succeeds.
    async fn create(
        &self,
        account_name: &str,
        access_key: &str,
        container_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;
}

/// The set of backend clients handed to the service modules.
#[derive(Clone)]
pub struct CloudClients {
    /// Template deployments.
    pub arm: Arc<dyn ArmDeployer>,
    /// Search services.
    pub search: Arc<dyn SearchServicesClient>,
    /// Storage accounts.
    pub storage_accounts: Arc<dyn StorageAccountsClient>,
    /// Blob containers.
    pub blob_containers: Arc<dyn BlobContainersClient>,
}

impl std::fmt::Debug for CloudClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClients").finish_non_exhaustive()
    }
}

impl<T> From<Arc<T>> for CloudClients
where
    T: ArmDeployer + SearchServicesClient + StorageAccountsClient + BlobContainersClient + 'static,
{
    fn from(cloud: Arc<T>) -> Self {
        Self {
            arm: cloud.clone(),
            search: cloud.clone(),
            storage_accounts: cloud.clone(),
            blob_containers: cloud,
        }
    }
}

/// Read a string output of a finished deployment.
pub(crate) fn output_string(outputs: &Map<String, Value>, key: &str) -> Result<String, StepError> {
    outputs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepError::hard(format!("deployment output '{}' missing", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_error_classification() {
        let cases = vec![
            (BackendError::Throttled("429".into()), true),
            (BackendError::Unavailable("503".into()), true),
            (BackendError::Conflict("locked".into()), false),
            (BackendError::Invalid("bad sku".into()), false),
            (BackendError::QuotaExceeded("cores".into()), false),
            (BackendError::NotFound("rg".into()), false),
            (BackendError::Cancelled("shutdown".into()), true),
        ];

        for (err, transient) in cases {
            assert_eq!(err.is_transient(), transient, "{:?}", err);
            match StepError::from(err.clone()) {
                StepError::Transient(msg) => {
                    assert!(transient);
                    assert_eq!(msg, err.to_string());
                }
                StepError::Hard(msg) => {
                    assert!(!transient);
                    assert_eq!(msg, err.to_string());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_output_string() {
        let outputs = json!({"apiKey": "k-1", "count": 3});
        let outputs = outputs.as_object().unwrap();

        assert_eq!(output_string(outputs, "apiKey").unwrap(), "k-1");
        assert!(matches!(output_string(outputs, "count"), Err(StepError::Hard(_))));
        assert!(matches!(output_string(outputs, "missing"), Err(StepError::Hard(_))));
    }
}
