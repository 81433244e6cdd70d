// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Engine
//!
//! Runs the lifecycle engine with the search and storage modules:
//! - SQLite persistence with sealed sensitive details
//! - Operation poller resuming parked deployments
//!
//! The cloud backend is the in-process simulation.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use broker_core::config::Config;
use broker_core::persistence::SqlitePersistence;
use broker_core::runtime::BrokerRuntime;
use broker_services::{CloudClients, SimulatedCloud};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker_core=info".parse()?)
                .add_directive("broker_services=info".parse()?),
        )
        .init();

    info!("Starting broker engine");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database = %config.database_path.display(),
        poll_interval_secs = config.poll_interval.as_secs(),
        max_concurrent_polls = config.max_concurrent_polls,
        "Configuration loaded"
    );

    let persistence =
        Arc::new(SqlitePersistence::from_path(&config.database_path, config.cipher.clone()).await?);
    info!("Database ready");

    let cloud = Arc::new(SimulatedCloud::new().with_deployment_polls(2));
    let registry = broker_services::registry(CloudClients::from(cloud))?;

    let runtime = BrokerRuntime::builder()
        .persistence(persistence)
        .registry(Arc::new(registry))
        .poller_config(config.poller_config())
        .executor_config(config.executor_config())
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
