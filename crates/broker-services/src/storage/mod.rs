// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Azure Storage service module.
//!
//! Three plans share one detail shape: a general purpose account, a blob
//! storage account, and a blob storage account with a single container.
//! Only the container plan runs `createBlobContainer` and hands out a
//! container name with its credentials.

use std::sync::Arc;

use broker_core::codec::{Credentials, DetailCodec, DetailShape, SecretShape, ShapeCodec};
use broker_core::error::Result;
use broker_core::instance::{InstanceRecord, LifecycleOperation};
use broker_core::registry::ServiceModule;
use broker_core::sequence::{SequenceError, StepSequence};
use broker_core::step::{StepContext, StepOutcome, StepOutput, StepResult};
use broker_core::StepError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

use crate::backend::{
    ArmDeployer, BlobContainersClient, CloudClients, DeploymentRequest, StorageAccountsClient,
    output_string,
};
use crate::deployment::{DeploymentProgress, delete_deployment, drive_deployment};
use crate::module_step;

/// Catalog service ID.
pub const SERVICE_ID: &str = "storage";

/// Storage catalog plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePlan {
    /// General purpose (v1) storage account.
    GeneralPurposeStorageAccount,
    /// Blob-only storage account.
    BlobStorageAccount,
    /// Blob storage account holding one container.
    BlobContainer,
}

impl StoragePlan {
    /// Every plan, in catalog order.
    pub const ALL: [StoragePlan; 3] = [
        Self::GeneralPurposeStorageAccount,
        Self::BlobStorageAccount,
        Self::BlobContainer,
    ];

    /// Catalog plan ID.
    pub fn id(&self) -> &'static str {
        match self {
            Self::GeneralPurposeStorageAccount => "general-purpose-storage-account",
            Self::BlobStorageAccount => "blob-storage-account",
            Self::BlobContainer => "blob-container",
        }
    }

    /// Look up a plan by catalog ID.
    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|plan| plan.id() == id)
    }

    fn account_kind(&self) -> &'static str {
        match self {
            Self::GeneralPurposeStorageAccount => "Storage",
            Self::BlobStorageAccount | Self::BlobContainer => "BlobStorage",
        }
    }
}

/// Non-sensitive storage instance details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageDetails {
    /// Name of the template deployment.
    #[serde(rename = "armDeployment", default)]
    pub arm_deployment: String,
    /// Storage account name.
    #[serde(rename = "storageAccountName", default)]
    pub storage_account_name: String,
    /// Container name; empty except for the container plan.
    #[serde(rename = "containerName", default)]
    pub container_name: String,
}

impl DetailShape for StorageDetails {
    const KIND: &'static str = "storage";
}

/// Sensitive storage instance details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSecrets {
    /// Primary account access key.
    #[serde(rename = "accessKey", default)]
    pub access_key: String,
}

impl SecretShape for StorageSecrets {
    const KIND: &'static str = "storage";
}

/// Codec for storage instance details.
pub type StorageCodec = DetailCodec<StorageDetails, StorageSecrets>;

/// Credentials handed out for a storage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCredentials {
    /// Storage account name.
    #[serde(rename = "storageAccountName")]
    pub storage_account_name: String,
    /// Primary account access key.
    #[serde(rename = "accessKey")]
    pub access_key: String,
    /// Container name, container plan only.
    #[serde(
        rename = "containerName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub container_name: Option<String>,
}

/// Storage service module.
#[derive(Clone)]
pub struct StorageModule {
    arm: Arc<dyn ArmDeployer>,
    accounts: Arc<dyn StorageAccountsClient>,
    containers: Arc<dyn BlobContainersClient>,
    codec: StorageCodec,
}

impl std::fmt::Debug for StorageModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageModule").finish_non_exhaustive()
    }
}

fn plan_of(instance: &InstanceRecord) -> std::result::Result<StoragePlan, StepError> {
    StoragePlan::parse(&instance.plan_id)
        .ok_or_else(|| StepError::hard(format!("unknown storage plan '{}'", instance.plan_id)))
}

impl StorageModule {
    /// Create the module over the given backend.
    pub fn new(clients: &CloudClients) -> Self {
        Self {
            arm: clients.arm.clone(),
            accounts: clients.storage_accounts.clone(),
            containers: clients.blob_containers.clone(),
            codec: StorageCodec::new(),
        }
    }

    async fn pre_provision(&self, _ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let plan = plan_of(&instance)?;
        let mut details = self.codec.decode_details(&instance.details)?;

        if details.arm_deployment.is_empty() {
            details.arm_deployment = Uuid::new_v4().to_string();
        }
        if details.storage_account_name.is_empty() {
            // Account names are 3-24 lowercase alphanumerics.
            let suffix = Uuid::new_v4().simple().to_string();
            details.storage_account_name = format!("sa{}", &suffix[..22]);
        }
        if plan == StoragePlan::BlobContainer && details.container_name.is_empty() {
            details.container_name = instance
                .parameters
                .get("containerName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
        }
        Ok(StepOutcome::Complete(self.codec.details_output(&details)?))
    }

    async fn deploy_arm_template(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let plan = plan_of(&instance)?;
        let details = self.codec.decode_details(&instance.details)?;

        let mut parameters = Map::new();
        parameters.insert(
            "name".into(),
            Value::String(details.storage_account_name.clone()),
        );
        parameters.insert("location".into(), Value::String(instance.location.clone()));
        parameters.insert("kind".into(), Value::String(plan.account_kind().to_string()));

        let request = DeploymentRequest {
            name: details.arm_deployment.clone(),
            resource_group: instance.resource_group.clone(),
            location: instance.location.clone(),
            template: arm_template(),
            parameters,
        };

        match drive_deployment(self.arm.as_ref(), &ctx, request).await? {
            DeploymentProgress::Running(outcome) => Ok(outcome),
            DeploymentProgress::Finished(outputs) => {
                let secure = StorageSecrets {
                    access_key: output_string(&outputs, "accessKey")?,
                };
                Ok(StepOutcome::Complete(self.codec.output(&details, &secure)?))
            }
        }
    }

    async fn create_blob_container(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let typed = self.codec.decode(&instance)?;
        if typed.details.container_name.is_empty() || typed.secure.access_key.is_empty() {
            return Err(StepError::CorruptState(
                "container plan instance has no container name or access key".to_string(),
            ));
        }

        self.containers
            .create(
                &typed.details.storage_account_name,
                &typed.secure.access_key,
                &typed.details.container_name,
                ctx.cancellation(),
            )
            .await?;
        info!(
            instance_id = %ctx.instance_id,
            account = %typed.details.storage_account_name,
            container = %typed.details.container_name,
            "Blob container created"
        );
        Ok(StepOutcome::done())
    }

    async fn delete_arm_deployment(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let details = self.codec.decode_details(&instance.details)?;
        delete_deployment(
            self.arm.as_ref(),
            &ctx,
            &details.arm_deployment,
            &instance.resource_group,
        )
        .await?;
        Ok(StepOutcome::done())
    }

    async fn delete_storage_account(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let details = self.codec.decode_details(&instance.details)?;
        if !details.storage_account_name.is_empty() {
            self.accounts
                .delete(
                    &instance.resource_group,
                    &details.storage_account_name,
                    ctx.cancellation(),
                )
                .await?;
            info!(
                instance_id = %ctx.instance_id,
                account = %details.storage_account_name,
                "Storage account deleted"
            );
        }
        Ok(StepOutcome::done())
    }

    async fn refresh_access_key(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let details = self.codec.decode_details(&instance.details)?;
        let access_key = self
            .accounts
            .regenerate_key(
                &instance.resource_group,
                &details.storage_account_name,
                ctx.cancellation(),
            )
            .await?;
        info!(
            instance_id = %ctx.instance_id,
            account = %details.storage_account_name,
            "Access key regenerated"
        );
        let secure = self.codec.encode_secure(&StorageSecrets { access_key })?;
        Ok(StepOutcome::Complete(StepOutput::new().with_secure(secure)))
    }
}

impl ServiceModule for StorageModule {
    fn service_id(&self) -> &str {
        SERVICE_ID
    }

    fn plan_ids(&self) -> Vec<String> {
        StoragePlan::ALL
            .iter()
            .map(|plan| plan.id().to_string())
            .collect()
    }

    fn codec(&self) -> Arc<dyn ShapeCodec> {
        Arc::new(self.codec.clone())
    }

    fn sequence(
        &self,
        plan_id: &str,
        operation: LifecycleOperation,
    ) -> std::result::Result<Option<StepSequence>, SequenceError> {
        let Some(plan) = StoragePlan::parse(plan_id) else {
            return Ok(None);
        };
        let builder = StepSequence::builder(format!("{}/{}/{}", SERVICE_ID, plan_id, operation));
        let builder = match operation {
            LifecycleOperation::Provision => {
                let builder = builder
                    .shared_step(module_step(self, "preProvision", |m: Self, ctx, instance| {
                        async move { m.pre_provision(ctx, instance).await }
                    }))
                    .shared_step(module_step(self, "deployARMTemplate", |m: Self, ctx, instance| {
                        async move { m.deploy_arm_template(ctx, instance).await }
                    }));
                if plan == StoragePlan::BlobContainer {
                    builder.shared_step(module_step(
                        self,
                        "createBlobContainer",
                        |m: Self, ctx, instance| async move {
                            m.create_blob_container(ctx, instance).await
                        },
                    ))
                } else {
                    builder
                }
            }
            LifecycleOperation::Deprovision => builder
                .shared_step(module_step(self, "deleteARMDeployment", |m: Self, ctx, instance| {
                    async move { m.delete_arm_deployment(ctx, instance).await }
                }))
                .shared_step(module_step(self, "deleteStorageAccount", |m: Self, ctx, instance| {
                    async move { m.delete_storage_account(ctx, instance).await }
                })),
            LifecycleOperation::Bind => builder.shared_step(module_step(
                self,
                "refreshAccessKey",
                |m: Self, ctx, instance| async move { m.refresh_access_key(ctx, instance).await },
            )),
            _ => return Ok(None),
        };
        builder.build().map(Some)
    }

    fn credentials(&self, instance: &InstanceRecord) -> Result<Credentials> {
        let typed = self.codec.decode(instance)?;
        let container_name = Some(typed.details.container_name).filter(|name| !name.is_empty());
        Credentials::from_typed(&StorageCredentials {
            storage_account_name: typed.details.storage_account_name,
            access_key: typed.secure.access_key,
            container_name,
        })
    }
}

fn arm_template() -> Value {
    json!({
        "$schema": "https://schema.management.azure.com/schemas/2015-01-01/deploymentTemplate.json#",
        "contentVersion": "1.0.0.0",
        "parameters": {
            "name": { "type": "string" },
            "location": { "type": "string" },
            "kind": { "type": "string", "allowedValues": ["Storage", "BlobStorage"] }
        },
        "resources": [
            {
                "type": "Microsoft.Storage/storageAccounts",
                "apiVersion": "2016-01-01",
                "name": "[parameters('name')]",
                "location": "[parameters('location')]",
                "kind": "[parameters('kind')]",
                "sku": { "name": "Standard_LRS" },
                "properties": {
                    "encryption": { "services": { "blob": { "enabled": true } }, "keySource": "Microsoft.Storage" }
                }
            }
        ],
        "outputs": {
            "accessKey": {
                "type": "string",
                "value": "[listKeys(resourceId('Microsoft.Storage/storageAccounts', parameters('name')), '2016-01-01').keys[0].value]"
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedCloud;

    fn module() -> StorageModule {
        StorageModule::new(&CloudClients::from(Arc::new(SimulatedCloud::new())))
    }

    #[test]
    fn test_plans_round_trip() {
        for plan in StoragePlan::ALL {
            assert_eq!(StoragePlan::parse(plan.id()), Some(plan));
        }
        assert_eq!(StoragePlan::parse("premium"), None);
        assert_eq!(StoragePlan::BlobContainer.account_kind(), "BlobStorage");
    }

    #[test]
    fn test_container_step_only_for_container_plan() {
        let module = module();
        let account = module
            .sequence("blob-storage-account", LifecycleOperation::Provision)
            .unwrap()
            .unwrap();
        assert_eq!(account.step_names(), vec!["preProvision", "deployARMTemplate"]);

        let container = module
            .sequence("blob-container", LifecycleOperation::Provision)
            .unwrap()
            .unwrap();
        assert_eq!(
            container.step_names(),
            vec!["preProvision", "deployARMTemplate", "createBlobContainer"]
        );

        let bind = module
            .sequence("blob-container", LifecycleOperation::Bind)
            .unwrap()
            .unwrap();
        assert_eq!(bind.step_names(), vec!["refreshAccessKey"]);
        assert!(module.sequence("premium", LifecycleOperation::Provision).unwrap().is_none());
    }

    #[test]
    fn test_credentials_omit_empty_container() {
        let credentials = StorageCredentials {
            storage_account_name: "sa1".to_string(),
            access_key: "k".to_string(),
            container_name: None,
        };
        let value = serde_json::to_value(&credentials).unwrap();
        assert!(value.get("containerName").is_none());
        assert_eq!(value["storageAccountName"], "sa1");
    }
}
