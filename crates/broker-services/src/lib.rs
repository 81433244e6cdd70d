// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Services - reference service modules for the broker engine.
//!
//! Two modules plug into [`broker_core::ServiceRegistry`]:
//!
//! | Service | Plans | Provision | Deprovision | Bind |
//! |---------|-------|-----------|-------------|------|
//! | `search` | `free`, `basic`, `standard-s1` | preProvision, deployARMTemplate | deleteARMDeployment, deleteAzureSearch | - |
//! | `storage` | `general-purpose-storage-account`, `blob-storage-account`, `blob-container` | preProvision, deployARMTemplate, createBlobContainer (container plan) | deleteARMDeployment, deleteStorageAccount | refreshAccessKey |
//!
//! Both talk to the cloud through the traits in [`backend`]. The
//! [`simulated::SimulatedCloud`] implementation backs the `broker-engine`
//! binary and the tests.

#![deny(missing_docs)]

use std::future::Future;
use std::sync::Arc;

use broker_core::registry::{RegistryError, ServiceRegistry};
use broker_core::{InstanceRecord, Step, StepContext, StepResult, step_fn};

/// Backend traits and error classification.
pub mod backend;

mod deployment;

/// Search service module.
pub mod search;

/// In-memory cloud backend.
pub mod simulated;

/// Storage service module.
pub mod storage;

pub use backend::{BackendError, CloudClients};
pub use search::SearchModule;
pub use simulated::SimulatedCloud;
pub use storage::StorageModule;

/// Registry holding both reference modules.
pub fn registry(clients: CloudClients) -> Result<ServiceRegistry, RegistryError> {
    ServiceRegistry::builder()
        .register(Arc::new(SearchModule::new(&clients)))
        .register(Arc::new(StorageModule::new(&clients)))
        .build()
}

/// Wrap a module method as a named step holding its own copy of the module.
pub(crate) fn module_step<M, F, Fut>(module: &M, name: &str, run: F) -> Arc<dyn Step>
where
    M: Clone + Send + Sync + 'static,
    F: Fn(M, StepContext, InstanceRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    let module = module.clone();
    Arc::new(step_fn(name, move |ctx, instance| {
        run(module.clone(), ctx, instance)
    }))
}
