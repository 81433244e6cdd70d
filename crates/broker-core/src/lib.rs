// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Core - Service Instance Lifecycle Engine
//!
//! This crate turns "provision this service instance" or "deprovision this
//! instance" into an ordered sequence of idempotent steps run against a slow,
//! asynchronous provisioning backend. Every step's result is persisted before
//! the next one starts, so a sequence survives crashes, restarts and
//! scale-out, and resumes exactly where it stopped.
//!
//! # Architecture
//!
//! ```text
//!   request ──► WorkflowExecutor ◄──── OperationPoller (every N seconds)
//!                 │      │                     │
//!                 │      │ sequence/codec      │ list_in_progress
//!                 │      ▼                     ▼
//!                 │  ServiceRegistry      Persistence (SQLite / memory)
//!                 │      │                     ▲
//!                 │      ▼                     │ one save per step
//!                 └─► Step ──► backend ────────┘
//! ```
//!
//! # Step Outcomes
//!
//! | Outcome | Effect on the instance |
//! |---------|------------------------|
//! | `Complete` | Output merged into details, `step_index` advanced |
//! | `InProgress` | Token, deadline and next poll time persisted; executor returns `done = false` |
//! | `StepError::Transient` | Nothing advanced; retried after backoff |
//! | `StepError::Hard` | Status `failed`, details untouched, sequence halted |
//! | `StepError::CorruptState` | Status `failed` with a corrupt-state cause |
//!
//! An operation that is still parked after its deadline fails with a
//! timeout, which is recorded separately from backend failures. A stored
//! record that can no longer be decoded is failed in place as corrupt state
//! and never holds up polling of other instances.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BROKER_ENCRYPTION_KEY` | Yes | - | Base64 AES-256 key for sensitive details |
//! | `BROKER_DATABASE_PATH` | No | `.data/broker.db` | SQLite file |
//! | `BROKER_POLL_INTERVAL_SECS` | No | `5` | Poller scan interval |
//! | `BROKER_POLL_BATCH_SIZE` | No | `50` | Records examined per scan |
//! | `BROKER_MAX_CONCURRENT_POLLS` | No | `16` | Concurrent resumes |
//! | `BROKER_OPERATION_TIMEOUT_SECS` | No | `1800` | Default async operation deadline |
//! | `BROKER_BACKOFF_INITIAL_MS` | No | `1000` | First retry delay |
//! | `BROKER_BACKOFF_MAX_MS` | No | `60000` | Retry delay cap |

#![deny(missing_docs)]

/// Central retry/poll backoff policy.
pub mod backoff;

/// Typed detail shapes and bind-time credentials.
pub mod codec;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Workflow executor driving step sequences.
pub mod executor;

/// Instance record, statuses and detail bags.
pub mod instance;

/// Per-instance single-flight locks.
pub mod locks;

/// Persistence trait and backends.
pub mod persistence;

/// Background poller for parked operations.
pub mod poller;

/// Service module registry.
pub mod registry;

/// Embeddable runtime.
pub mod runtime;

/// Encryption at rest for sensitive details.
pub mod secrets;

/// Immutable step sequences.
pub mod sequence;

/// Step trait and outcomes.
pub mod step;

pub use codec::{Credentials, DetailCodec, DetailShape, SecretShape, ShapeCodec, Typed};
pub use error::{CoreError, Result, StepError};
pub use executor::{Execution, ExecutorConfig, WorkflowExecutor};
pub use instance::{
    DetailBag, FailureKind, InstanceRecord, InstanceStatus, LifecycleOperation, ProvisionRequest,
    SecureDetailBag,
};
pub use registry::{ServiceModule, ServiceRegistry};
pub use sequence::StepSequence;
pub use step::{Step, StepContext, StepOutcome, StepOutput, StepResult, step_fn};
