// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Search module lifecycle against the simulated cloud.

mod common;

use std::time::Duration;

use broker_core::instance::{FailureKind, InstanceStatus};
use broker_services::{BackendError, SimulatedCloud};
use broker_services::search::{SearchCodec, SearchCredentials};
use broker_services::simulated::CloudCall;
use common::*;
use tokio_util::sync::CancellationToken;

async fn provisioned(engine: &Engine) -> String {
    let request = request("search", "basic");
    let id = request.instance_id.clone();
    let execution = engine
        .executor
        .provision(request, CancellationToken::new())
        .await
        .unwrap();
    assert!(execution.done);
    engine.cloud.clear_calls().await;
    id
}

#[tokio::test]
async fn test_provision_deploys_and_stores_api_key_separately() {
    let engine = Engine::new();
    let id = provisioned(&engine).await;

    let record = engine.load(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Provisioned);

    let typed = SearchCodec::new().decode(&record).unwrap();
    assert!(typed.details.service_name.starts_with("search-"));
    assert!(typed.secure.api_key.starts_with("apiKey-"));
    assert!(record.details.get("apiKey").is_none());
    assert_eq!(
        engine
            .cloud
            .resource_type(RESOURCE_GROUP, &typed.details.service_name)
            .await
            .as_deref(),
        Some("Microsoft.Search/searchServices")
    );

    let credentials: SearchCredentials = engine
        .executor
        .credentials(&id)
        .await
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(credentials.api_key, typed.secure.api_key);
}

#[tokio::test]
async fn test_deprovision_runs_steps_in_order_and_removes_record() {
    let engine = Engine::new();
    let id = provisioned(&engine).await;
    let details = SearchCodec::new()
        .decode_details(&engine.load(&id).await.unwrap().details)
        .unwrap();

    let execution = engine
        .executor
        .deprovision(&id, CancellationToken::new())
        .await
        .unwrap();

    assert!(execution.done);
    assert_eq!(
        engine.cloud.calls().await,
        vec![CloudCall::DeleteDeployment, CloudCall::DeleteSearchService]
    );
    assert!(engine.load(&id).await.is_none());
    assert!(
        !engine
            .cloud
            .has_deployment(RESOURCE_GROUP, &details.arm_deployment)
            .await
    );
    assert!(
        engine
            .cloud
            .resource_type(RESOURCE_GROUP, &details.service_name)
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_failed_deployment_delete_halts_deprovisioning() {
    let engine = Engine::new();
    let id = provisioned(&engine).await;
    let before = engine.load(&id).await.unwrap();
    engine
        .cloud
        .fail_next(
            CloudCall::DeleteDeployment,
            BackendError::Conflict("deployment is locked".into()),
        )
        .await;

    let err = engine
        .executor
        .deprovision(&id, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "STEP_FAILED");
    assert_eq!(engine.cloud.calls().await, vec![CloudCall::DeleteDeployment]);

    let failed = engine.load(&id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::Backend));
    assert_eq!(failed.details, before.details);
    assert_eq!(failed.secure_details, before.secure_details);
}

#[tokio::test]
async fn test_throttled_delete_is_retried_without_advancing() {
    let engine = Engine::new();
    let id = provisioned(&engine).await;
    engine
        .cloud
        .fail_next(
            CloudCall::DeleteSearchService,
            BackendError::Throttled("429".into()),
        )
        .await;

    let err = engine
        .executor
        .deprovision(&id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let parked = engine.load(&id).await.unwrap();
    assert_eq!(parked.status, InstanceStatus::Deprovisioning);
    assert_eq!(parked.step_index, 1);

    let execution = engine
        .executor
        .execute(&id, CancellationToken::new())
        .await
        .unwrap();
    assert!(execution.done);
    assert!(engine.load(&id).await.is_none());
}

#[tokio::test]
async fn test_failed_deployment_fails_instance() {
    let engine = Engine::new();
    engine.cloud.fail_deployments(Some("sku not available")).await;

    let request = request("search", "free");
    let id = request.instance_id.clone();
    let err = engine
        .executor
        .provision(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "STEP_FAILED");

    let record = engine.load(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Failed);
    assert!(record.status_reason.unwrap().contains("sku not available"));
    assert!(record.secure_details.is_empty());
}

#[tokio::test]
async fn test_cancellation_reaches_in_flight_backend_call() {
    let engine = Engine::with_cloud(SimulatedCloud::new().with_latency(Duration::from_secs(30)));
    let request = request("search", "basic");
    let id = request.instance_id.clone();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine.executor.provision(request, cancel),
    )
    .await
    .expect("cancellation should end the deploy call")
    .unwrap_err();
    assert_eq!(err.error_code(), "CANCELLED");
    assert!(engine.cloud.calls().await.is_empty());

    // preProvision committed; the deploy step did not.
    let record = engine.load(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Provisioning);
    assert_eq!(record.step_index, 1);
    assert!(record.operation_token.is_none());
}
