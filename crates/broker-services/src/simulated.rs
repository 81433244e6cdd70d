// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cloud backend.
//!
//! [`SimulatedCloud`] implements every backend trait against in-memory
//! state. Deployments stay running for a configurable number of status
//! polls, template outputs are generated, and failures can be queued per
//! call kind. An optional per-call latency stands in for the network round
//! trip and is cut short by the caller's cancellation token. The engine
//! binary runs against it, and so do the tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    ArmDeployer, BackendError, BackendResult, BlobContainersClient, DeploymentRequest,
    DeploymentState, SearchServicesClient, StorageAccountsClient,
};

/// Kinds of backend calls, for failure injection and call assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudCall {
    /// [`ArmDeployer::deploy`]
    Deploy,
    /// [`ArmDeployer::status`]
    DeploymentStatus,
    /// [`ArmDeployer::delete`]
    DeleteDeployment,
    /// [`SearchServicesClient::delete`]
    DeleteSearchService,
    /// [`StorageAccountsClient::delete`]
    DeleteStorageAccount,
    /// [`StorageAccountsClient::regenerate_key`]
    RegenerateKey,
    /// [`BlobContainersClient::create`]
    CreateContainer,
}

struct Deployment {
    resource_name: String,
    resource_type: String,
    polls_remaining: u32,
    outputs: Map<String, Value>,
    failure: Option<String>,
}

#[derive(Debug, Clone)]
struct Resource {
    resource_type: String,
    access_key: Option<String>,
}

#[derive(Default)]
struct CloudState {
    deployments: HashMap<(String, String), Deployment>,
    resources: HashMap<(String, String), Resource>,
    containers: HashSet<(String, String)>,
    failures: HashMap<CloudCall, VecDeque<BackendError>>,
    calls: Vec<CloudCall>,
    deployment_polls: u32,
    deployment_failure: Option<String>,
}

impl CloudState {
    /// Record a call and pop a queued failure for it.
    fn enter(&mut self, call: CloudCall) -> BackendResult<()> {
        self.calls.push(call);
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory cloud implementing every backend trait.
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
    latency: Duration,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCloud").finish_non_exhaustive()
    }
}

impl SimulatedCloud {
    /// Deployments succeed on their first status check.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call by `latency` before it reaches the cloud state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Wait out the simulated round trip. A cancelled call never reaches
    /// the cloud state and is not recorded.
    async fn round_trip(&self, cancel: &CancellationToken) -> BackendResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(BackendError::Cancelled("request abandoned by caller".into()))
            }
            _ = tokio::time::sleep(self.latency) => Ok(()),
        }
    }

    /// Keep new deployments running for `polls` status checks.
    pub fn with_deployment_polls(mut self, polls: u32) -> Self {
        self.state.get_mut().deployment_polls = polls;
        self
    }

    /// Make every subsequently submitted deployment end as failed.
    pub async fn fail_deployments(&self, reason: Option<&str>) {
        self.state.lock().await.deployment_failure = reason.map(str::to_string);
    }

    /// Queue an error for the next call of the given kind.
    pub async fn fail_next(&self, call: CloudCall, err: BackendError) {
        self.state
            .lock()
            .await
            .failures
            .entry(call)
            .or_default()
            .push_back(err);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().await.calls.clone()
    }

    /// Forget the recorded calls.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Whether a deployment record exists.
    pub async fn has_deployment(&self, resource_group: &str, name: &str) -> bool {
        self.state
            .lock()
            .await
            .deployments
            .contains_key(&key(resource_group, name))
    }

    /// Type of a deployed resource, if it exists.
    pub async fn resource_type(&self, resource_group: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .resources
            .get(&key(resource_group, name))
            .map(|r| r.resource_type.clone())
    }

    /// Whether a blob container exists.
    pub async fn has_container(&self, account_name: &str, container_name: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .contains(&key(account_name, container_name))
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

fn generated_secret(name: &str) -> String {
    format!("{}-{}", name, Uuid::new_v4().simple())
}

#[async_trait]
impl ArmDeployer for SimulatedCloud {
    async fn deploy(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::Deploy)?;

        let id = key(&request.resource_group, &request.name);
        if state.deployments.contains_key(&id) {
            return Ok(());
        }

        let resource_name = request
            .parameters
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Invalid("template parameter 'name' is required".into()))?
            .to_string();
        let resource_type = request.template["resources"][0]["type"]
            .as_str()
            .ok_or_else(|| BackendError::Invalid("template declares no resource".into()))?
            .to_string();
        if let Some(existing) = state.resources.get(&key(&request.resource_group, &resource_name)) {
            if existing.resource_type != resource_type {
                return Err(BackendError::Conflict(format!(
                    "resource '{}' already exists as {}",
                    resource_name, existing.resource_type
                )));
            }
        }

        let outputs: Map<String, Value> = request.template["outputs"]
            .as_object()
            .map(|declared| {
                declared
                    .keys()
                    .map(|name| (name.clone(), Value::String(generated_secret(name))))
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            deployment = %request.name,
            resource_group = %request.resource_group,
            resource = %resource_name,
            "Simulated deployment submitted"
        );
        let deployment = Deployment {
            resource_name,
            resource_type,
            polls_remaining: state.deployment_polls,
            outputs,
            failure: state.deployment_failure.clone(),
        };
        state.deployments.insert(id, deployment);
        Ok(())
    }

    async fn status(
        &self,
        name: &str,
        resource_group: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<DeploymentState> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::DeploymentStatus)?;

        let deployment = state
            .deployments
            .get_mut(&key(resource_group, name))
            .ok_or_else(|| BackendError::NotFound(format!("deployment '{}'", name)))?;

        if deployment.polls_remaining > 0 {
            deployment.polls_remaining -= 1;
            return Ok(DeploymentState::Running);
        }
        if let Some(reason) = &deployment.failure {
            return Ok(DeploymentState::Failed {
                reason: reason.clone(),
            });
        }

        let outputs = deployment.outputs.clone();
        let resource = Resource {
            resource_type: deployment.resource_type.clone(),
            access_key: outputs
                .get("accessKey")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let resource_name = deployment.resource_name.clone();
        state
            .resources
            .entry(key(resource_group, &resource_name))
            .or_insert(resource);

        Ok(DeploymentState::Succeeded { outputs })
    }

    async fn delete(
        &self,
        name: &str,
        resource_group: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::DeleteDeployment)?;
        state.deployments.remove(&key(resource_group, name));
        Ok(())
    }
}

#[async_trait]
impl SearchServicesClient for SimulatedCloud {
    async fn delete(
        &self,
        resource_group: &str,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::DeleteSearchService)?;
        state.resources.remove(&key(resource_group, service_name));
        Ok(())
    }
}

#[async_trait]
impl StorageAccountsClient for SimulatedCloud {
    async fn delete(
        &self,
        resource_group: &str,
        account_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::DeleteStorageAccount)?;
        state.resources.remove(&key(resource_group, account_name));
        state.containers.retain(|(account, _)| account != account_name);
        Ok(())
    }

    async fn regenerate_key(
        &self,
        resource_group: &str,
        account_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<String> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::RegenerateKey)?;
        let account = state
            .resources
            .get_mut(&key(resource_group, account_name))
            .ok_or_else(|| BackendError::NotFound(format!("storage account '{}'", account_name)))?;
        let fresh = generated_secret("accessKey");
        account.access_key = Some(fresh.clone());
        Ok(fresh)
    }
}

#[async_trait]
impl BlobContainersClient for SimulatedCloud {
    async fn create(
        &self,
        account_name: &str,
        access_key: &str,
        container_name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.round_trip(cancel).await?;
        let mut state = self.state.lock().await;
        state.enter(CloudCall::CreateContainer)?;

        let account = state
            .resources
            .iter()
            .find(|((_, name), _)| name == account_name)
            .map(|(_, resource)| resource)
            .ok_or_else(|| BackendError::NotFound(format!("storage account '{}'", account_name)))?;
        if account.access_key.as_deref() != Some(access_key) {
            return Err(BackendError::Invalid(format!(
                "access key rejected by account '{}'",
                account_name
            )));
        }
        state.containers.insert(key(account_name, container_name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn request(name: &str) -> DeploymentRequest {
        DeploymentRequest {
            name: name.to_string(),
            resource_group: "rg".to_string(),
            location: "westeurope".to_string(),
            template: json!({
                "resources": [{"type": "Microsoft.Storage/storageAccounts"}],
                "outputs": {"accessKey": {"type": "string"}}
            }),
            parameters: json!({"name": "acct1"}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_deployment_runs_for_configured_polls() {
        let cloud = SimulatedCloud::new().with_deployment_polls(2);
        cloud.deploy(&request("d-1"), &live()).await.unwrap();
        cloud.deploy(&request("d-1"), &live()).await.unwrap();

        assert_eq!(cloud.status("d-1", "rg", &live()).await.unwrap(), DeploymentState::Running);
        assert_eq!(cloud.status("d-1", "rg", &live()).await.unwrap(), DeploymentState::Running);
        assert!(cloud.resource_type("rg", "acct1").await.is_none());

        let DeploymentState::Succeeded { outputs } = cloud.status("d-1", "rg", &live()).await.unwrap()
        else {
            panic!("deployment should have succeeded");
        };
        let access_key = outputs["accessKey"].as_str().unwrap().to_string();
        assert!(access_key.starts_with("accessKey-"));
        assert_eq!(
            cloud.resource_type("rg", "acct1").await.as_deref(),
            Some("Microsoft.Storage/storageAccounts")
        );

        cloud.create("acct1", &access_key, "c1", &live()).await.unwrap();
        assert!(cloud.has_container("acct1", "c1").await);
        assert!(matches!(
            cloud.create("acct1", "wrong", "c2", &live()).await,
            Err(BackendError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed_once() {
        let cloud = SimulatedCloud::new();
        cloud
            .fail_next(CloudCall::Deploy, BackendError::Throttled("slow down".into()))
            .await;

        assert!(matches!(
            cloud.deploy(&request("d-1"), &live()).await,
            Err(BackendError::Throttled(_))
        ));
        cloud.deploy(&request("d-1"), &live()).await.unwrap();
        assert_eq!(cloud.calls().await, vec![CloudCall::Deploy, CloudCall::Deploy]);
    }

    #[tokio::test]
    async fn test_failed_deployment_and_missing_status() {
        let cloud = SimulatedCloud::new();
        cloud.fail_deployments(Some("sku unavailable")).await;
        cloud.deploy(&request("d-1"), &live()).await.unwrap();

        assert_eq!(
            cloud.status("d-1", "rg", &live()).await.unwrap(),
            DeploymentState::Failed {
                reason: "sku unavailable".to_string()
            }
        );
        assert!(matches!(
            cloud.status("nope", "rg", &live()).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let cloud = SimulatedCloud::new();
        ArmDeployer::delete(&cloud, "missing", "rg", &live()).await.unwrap();
        SearchServicesClient::delete(&cloud, "rg", "missing", &live()).await.unwrap();
        StorageAccountsClient::delete(&cloud, "rg", "missing", &live())
            .await.unwrap();
        assert!(matches!(
            cloud.regenerate_key("rg", "missing", &live()).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_recorded() {
        let cloud = SimulatedCloud::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            cloud.deploy(&request("d-1"), &cancel).await,
            Err(BackendError::Cancelled(_))
        ));
        assert!(cloud.calls().await.is_empty());
        assert!(!cloud.has_deployment("rg", "d-1").await);
    }

    #[tokio::test]
    async fn test_cancellation_cuts_latency_short() {
        let cloud = SimulatedCloud::new().with_latency(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            cloud.deploy(&request("d-1"), &cancel),
        )
        .await
        .expect("cancellation should end the call");
        assert!(matches!(result, Err(BackendError::Cancelled(_))));
        assert!(cloud.calls().await.is_empty());
    }
}
