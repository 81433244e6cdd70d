// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for broker-core.
//!
//! [`BrokerRuntime`] wires persistence, the service registry, the workflow
//! executor and the operation poller together inside an existing tokio
//! application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use broker_core::persistence::SqlitePersistence;
//! use broker_core::runtime::BrokerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/broker.db", cipher).await?);
//!
//!     let runtime = BrokerRuntime::builder()
//!         .persistence(persistence)
//!         .registry(Arc::new(registry))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.executor().provision(request, Default::default()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::executor::{ExecutorConfig, WorkflowExecutor};
use crate::persistence::Persistence;
use crate::poller::{OperationPoller, PollerConfig};
use crate::registry::ServiceRegistry;

/// Builder for creating a [`BrokerRuntime`].
#[derive(Default)]
pub struct BrokerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<ServiceRegistry>>,
    poller_config: PollerConfig,
    executor_config: ExecutorConfig,
}

impl std::fmt::Debug for BrokerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("poller_config", &self.poller_config)
            .field("executor_config", &self.executor_config)
            .finish()
    }
}

impl BrokerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the service registry (required).
    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set poller settings.
    pub fn poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    /// Set executor settings.
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<BrokerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        Ok(BrokerRuntimeConfig {
            executor: Arc::new(WorkflowExecutor::new(
                persistence,
                registry,
                self.executor_config,
            )),
            poller_config: self.poller_config,
        })
    }
}

/// Configuration for a [`BrokerRuntime`].
#[derive(Debug)]
pub struct BrokerRuntimeConfig {
    executor: Arc<WorkflowExecutor>,
    poller_config: PollerConfig,
}

impl BrokerRuntimeConfig {
    /// Start the runtime, spawning the poller task.
    pub async fn start(self) -> Result<BrokerRuntime> {
        if !self.executor.persistence().health_check().await? {
            anyhow::bail!("persistence health check failed");
        }

        let poller = Arc::new(OperationPoller::new(
            self.executor.clone(),
            self.poller_config,
        ));
        let shutdown = poller.shutdown_handle();
        let cancel = poller.cancellation_token();

        let poller_handle = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.run().await })
        };

        info!(
            services = ?self.executor.registry().service_ids(),
            "BrokerRuntime started"
        );

        Ok(BrokerRuntime {
            executor: self.executor,
            poller,
            poller_handle,
            shutdown,
            cancel,
        })
    }
}

/// A running broker engine embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BrokerRuntime {
    executor: Arc<WorkflowExecutor>,
    poller: Arc<OperationPoller>,
    poller_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BrokerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRuntime")
            .field("executor", &self.executor)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BrokerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BrokerRuntimeBuilder {
        BrokerRuntimeBuilder::new()
    }

    /// The workflow executor, for request-driven operations.
    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    /// The background poller.
    pub fn poller(&self) -> &Arc<OperationPoller> {
        &self.poller
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.executor.persistence()
    }

    /// Stop the poller and abandon steps it is running.
    ///
    /// Abandoned steps commit nothing; the poller of the next process
    /// resumes them.
    pub async fn shutdown(self) -> Result<()> {
        info!("BrokerRuntime shutting down...");

        self.shutdown.notify_one();
        self.cancel.cancel();

        match self.poller_handle.await {
            Ok(()) => {
                info!("BrokerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("BrokerRuntime poller task panicked: {}", e);
                Err(anyhow::anyhow!("poller task panicked: {}", e))
            }
        }
    }

    /// Check if the poller is still running.
    pub fn is_running(&self) -> bool {
        !self.poller_handle.is_finished()
    }
}
