// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for broker-services integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use broker_core::backoff::BackoffPolicy;
use broker_core::executor::{ExecutorConfig, WorkflowExecutor};
use broker_core::instance::{InstanceRecord, ProvisionRequest};
use broker_core::persistence::{MemoryPersistence, Persistence};
use broker_services::{CloudClients, SimulatedCloud};
use uuid::Uuid;

pub const RESOURCE_GROUP: &str = "rg-broker-test";

/// Engine wired to both service modules over a simulated cloud.
pub struct Engine {
    pub cloud: Arc<SimulatedCloud>,
    pub persistence: Arc<dyn Persistence>,
    pub executor: Arc<WorkflowExecutor>,
}

impl Engine {
    /// Deployments finish on their first status check.
    pub fn new() -> Self {
        Self::with_cloud(SimulatedCloud::new())
    }

    pub fn with_cloud(cloud: SimulatedCloud) -> Self {
        let cloud = Arc::new(cloud);
        let registry = broker_services::registry(CloudClients::from(cloud.clone()))
            .expect("reference modules should register");
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let executor = Arc::new(WorkflowExecutor::new(
            persistence.clone(),
            Arc::new(registry),
            ExecutorConfig {
                operation_timeout: Duration::from_secs(60),
                backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            },
        ));
        Self {
            cloud,
            persistence,
            executor,
        }
    }

    pub async fn load(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.persistence.load(instance_id).await.expect("load")
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn request(service_id: &str, plan_id: &str) -> ProvisionRequest {
    ProvisionRequest::new(new_id(), service_id, plan_id).in_location("westeurope", RESOURCE_GROUP)
}
