// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Azure Search service module.

use std::sync::Arc;

use broker_core::codec::{Credentials, DetailCodec, DetailShape, SecretShape, ShapeCodec};
use broker_core::error::Result;
use broker_core::instance::{InstanceRecord, LifecycleOperation};
use broker_core::registry::ServiceModule;
use broker_core::sequence::{SequenceError, StepSequence};
use broker_core::step::{StepContext, StepOutcome, StepResult};
use broker_core::StepError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

use crate::backend::{
    ArmDeployer, CloudClients, DeploymentRequest, SearchServicesClient, output_string,
};
use crate::deployment::{DeploymentProgress, delete_deployment, drive_deployment};
use crate::module_step;

/// Catalog service ID.
pub const SERVICE_ID: &str = "search";

/// Search plans and the SKU each one deploys.
pub const PLANS: &[(&str, &str)] = &[
    ("free", "free"),
    ("basic", "basic"),
    ("standard-s1", "standard"),
];

/// Non-sensitive search instance details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchDetails {
    /// Name of the template deployment.
    #[serde(rename = "armDeployment", default)]
    pub arm_deployment: String,
    /// Name of the search service.
    #[serde(rename = "serviceName", default)]
    pub service_name: String,
}

impl DetailShape for SearchDetails {
    const KIND: &'static str = "search";
}

/// Sensitive search instance details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSecrets {
    /// Admin API key.
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
}

impl SecretShape for SearchSecrets {
    const KIND: &'static str = "search";
}

/// Codec for search instance details.
pub type SearchCodec = DetailCodec<SearchDetails, SearchSecrets>;

/// Credentials handed out for a search instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCredentials {
    /// Search service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Admin API key.
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

/// Search service module.
#[derive(Clone)]
pub struct SearchModule {
    arm: Arc<dyn ArmDeployer>,
    services: Arc<dyn SearchServicesClient>,
    codec: SearchCodec,
}

impl std::fmt::Debug for SearchModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchModule").finish_non_exhaustive()
    }
}

impl SearchModule {
    /// Create the module over the given backend.
    pub fn new(clients: &CloudClients) -> Self {
        Self {
            arm: clients.arm.clone(),
            services: clients.search.clone(),
            codec: SearchCodec::new(),
        }
    }

    async fn pre_provision(&self, _ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let mut details = self.codec.decode_details(&instance.details)?;
        if details.arm_deployment.is_empty() {
            details.arm_deployment = Uuid::new_v4().to_string();
        }
        if details.service_name.is_empty() {
            details.service_name = format!("search-{}", Uuid::new_v4().simple());
        }
        Ok(StepOutcome::Complete(self.codec.details_output(&details)?))
    }

    async fn deploy_arm_template(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let details = self.codec.decode_details(&instance.details)?;
        let sku = PLANS
            .iter()
            .find(|(plan, _)| *plan == instance.plan_id)
            .map(|(_, sku)| *sku)
            .ok_or_else(|| StepError::hard(format!("unknown search plan '{}'", instance.plan_id)))?;

        let mut parameters = Map::new();
        parameters.insert("name".into(), Value::String(details.service_name.clone()));
        parameters.insert("location".into(), Value::String(instance.location.clone()));
        parameters.insert("sku".into(), Value::String(sku.to_string()));

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
                let secure = SearchSecrets {
                    api_key: output_string(&outputs, "apiKey")?,
                };
                Ok(StepOutcome::Complete(self.codec.output(&details, &secure)?))
            }
        }
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

    async fn delete_azure_search(&self, ctx: StepContext, instance: InstanceRecord) -> StepResult {
        let details = self.codec.decode_details(&instance.details)?;
        if !details.service_name.is_empty() {
            self.services
                .delete(
                    &instance.resource_group,
                    &details.service_name,
                    ctx.cancellation(),
                )
                .await?;
            info!(
                instance_id = %ctx.instance_id,
                service_name = %details.service_name,
                "Search service deleted"
            );
        }
        Ok(StepOutcome::done())
    }
}

impl ServiceModule for SearchModule {
    fn service_id(&self) -> &str {
        SERVICE_ID
    }

    fn plan_ids(&self) -> Vec<String> {
        PLANS.iter().map(|(plan, _)| plan.to_string()).collect()
    }

    fn codec(&self) -> Arc<dyn ShapeCodec> {
        Arc::new(self.codec.clone())
    }

    fn sequence(
        &self,
        _plan_id: &str,
        operation: LifecycleOperation,
    ) -> std::result::Result<Option<StepSequence>, SequenceError> {
        let builder = StepSequence::builder(format!("{}/{}", SERVICE_ID, operation));
        let builder = match operation {
            LifecycleOperation::Provision => builder
                .shared_step(module_step(self, "preProvision", |m: Self, ctx, instance| {
                    async move { m.pre_provision(ctx, instance).await }
                }))
                .shared_step(module_step(self, "deployARMTemplate", |m: Self, ctx, instance| {
                    async move { m.deploy_arm_template(ctx, instance).await }
                })),
            LifecycleOperation::Deprovision => builder
                .shared_step(module_step(self, "deleteARMDeployment", |m: Self, ctx, instance| {
                    async move { m.delete_arm_deployment(ctx, instance).await }
                }))
                .shared_step(module_step(self, "deleteAzureSearch", |m: Self, ctx, instance| {
                    async move { m.delete_azure_search(ctx, instance).await }
                })),
            _ => return Ok(None),
        };
        builder.build().map(Some)
    }

    fn credentials(&self, instance: &InstanceRecord) -> Result<Credentials> {
        let typed = self.codec.decode(instance)?;
        Credentials::from_typed(&SearchCredentials {
            service_name: typed.details.service_name,
            api_key: typed.secure.api_key,
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
            "sku": { "type": "string" }
        },
        "resources": [
            {
                "type": "Microsoft.Search/searchServices",
                "apiVersion": "2015-08-19",
                "name": "[parameters('name')]",
                "location": "[parameters('location')]",
                "sku": { "name": "[parameters('sku')]" },
                "properties": {
                    "replicaCount": 1,
                    "partitionCount": 1,
                    "hostingMode": "default"
                }
            }
        ],
        "outputs": {
            "apiKey": {
                "type": "string",
                "value": "[listAdminKeys(resourceId('Microsoft.Search/searchServices', parameters('name')), '2015-08-19').primaryKey]"
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedCloud;
    use broker_core::instance::ProvisionRequest;
    use tokio_util::sync::CancellationToken;

    fn module() -> (Arc<SimulatedCloud>, SearchModule) {
        let cloud = Arc::new(SimulatedCloud::new());
        let module = SearchModule::new(&CloudClients::from(cloud.clone()));
        (cloud, module)
    }

    fn ctx(token: Option<&str>) -> StepContext {
        StepContext::new("i-1", token.map(str::to_string), 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_pre_provision_keeps_existing_names() {
        let (_, module) = module();
        let mut instance = ProvisionRequest::new("i-1", SERVICE_ID, "basic")
            .into_record()
            .unwrap();

        let StepOutcome::Complete(first) = module
            .pre_provision(ctx(None), instance.clone())
            .await
            .unwrap()
        else {
            panic!("preProvision should complete");
        };
        instance.details = first.details.clone().unwrap();
        let StepOutcome::Complete(second) = module.pre_provision(ctx(None), instance).await.unwrap()
        else {
            panic!("preProvision should complete");
        };

        assert_eq!(first.details, second.details);
        assert!(first.secure_details.is_none());
    }

    #[test]
    fn test_sequences_per_operation() {
        let (_, module) = module();
        let provision = module
            .sequence("free", LifecycleOperation::Provision)
            .unwrap()
            .unwrap();
        assert_eq!(provision.step_names(), vec!["preProvision", "deployARMTemplate"]);

        let deprovision = module
            .sequence("free", LifecycleOperation::Deprovision)
            .unwrap()
            .unwrap();
        assert_eq!(
            deprovision.step_names(),
            vec!["deleteARMDeployment", "deleteAzureSearch"]
        );

        assert!(module.sequence("free", LifecycleOperation::Bind).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_step_makes_no_backend_call() {
        let (cloud, module) = module();
        let mut instance = ProvisionRequest::new("i-1", SERVICE_ID, "basic")
            .into_record()
            .unwrap();
        instance.details = SearchCodec::new()
            .details_output(&SearchDetails {
                arm_deployment: "d-1".to_string(),
                service_name: "search-1".to_string(),
            })
            .unwrap()
            .details
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = StepContext::new("i-1", None, 1, cancel);

        let err = module.delete_azure_search(ctx, instance).await.unwrap_err();
        assert!(matches!(err, StepError::Transient(_)));
        assert!(cloud.calls().await.is_empty());
    }

    #[test]
    fn test_template_declares_api_key_output() {
        let template = arm_template();
        assert_eq!(
            template["resources"][0]["type"],
            "Microsoft.Search/searchServices"
        );
        assert!(template["outputs"]["apiKey"].is_object());
    }
}
