// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for broker-core integration tests.
//!
//! Provides a scripted "widget" service module whose steps record every
//! invocation and replay queued results, and a [`Harness`] wiring it to an
//! executor over in-memory persistence.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use broker_core::backoff::BackoffPolicy;
use broker_core::codec::{Credentials, DetailCodec, DetailShape, SecretShape, ShapeCodec};
use broker_core::error::{Result, StepError};
use broker_core::executor::{ExecutorConfig, WorkflowExecutor};
use broker_core::instance::{
    DetailBag, InstanceRecord, InstanceStatus, LifecycleOperation, ProvisionRequest,
    SecureDetailBag,
};
use broker_core::persistence::{MemoryPersistence, Persistence};
use broker_core::registry::{ServiceModule, ServiceRegistry};
use broker_core::sequence::{SequenceError, StepSequence};
use broker_core::step::{Step, StepContext, StepOutcome, StepOutput, StepResult};

pub const SERVICE: &str = "widget";
pub const PLAN: &str = "standard";

/// Non-sensitive widget details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WidgetDetails {
    #[serde(rename = "armDeployment", default)]
    pub arm_deployment: String,
    #[serde(rename = "widgetName", default)]
    pub widget_name: String,
    #[serde(default)]
    pub endpoint: String,
}

impl DetailShape for WidgetDetails {
    const KIND: &'static str = "widget";
}

/// Sensitive widget details.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WidgetSecrets {
    #[serde(default)]
    pub password: String,
}

impl SecretShape for WidgetSecrets {
    const KIND: &'static str = "widget";
}

pub type WidgetCodec = DetailCodec<WidgetDetails, WidgetSecrets>;

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn details(value: Value) -> DetailBag {
    DetailBag::tagged(WidgetDetails::KIND, fields(value))
}

pub fn secure(value: Value) -> SecureDetailBag {
    SecureDetailBag::tagged(WidgetSecrets::KIND, fields(value))
}

/// Invocation recorded by a scripted step.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub step: String,
    pub token: Option<String>,
    pub attempt: u32,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Step that replays queued results, falling back to a fixed output.
pub struct ScriptedStep {
    name: String,
    log: CallLog,
    queued: Mutex<VecDeque<StepResult>>,
    fallback: StepOutput,
    delay: Mutex<Option<Duration>>,
    hang: Mutex<bool>,
}

impl ScriptedStep {
    pub fn new(name: &str, log: CallLog, fallback: StepOutput) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            queued: Mutex::new(VecDeque::new()),
            fallback,
            delay: Mutex::new(None),
            hang: Mutex::new(false),
        })
    }

    /// Queue a result for the next invocation.
    pub fn push(&self, result: StepResult) {
        self.queued.lock().unwrap().push_back(result);
    }

    /// Queue an in-progress result.
    pub fn push_in_progress(&self, token: &str, retry_after: Option<Duration>, max_wait: Option<Duration>) {
        self.push(Ok(StepOutcome::InProgress {
            token: token.to_string(),
            retry_after,
            max_wait,
        }));
    }

    /// Sleep this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Never answer.
    pub fn set_hang(&self, hang: bool) {
        *self.hang.lock().unwrap() = hang;
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: StepContext, _instance: InstanceRecord) -> StepResult {
        self.log.lock().unwrap().push(Call {
            step: self.name.clone(),
            token: ctx.operation_token.clone(),
            attempt: ctx.attempt,
        });

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hang = *self.hang.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }

        let queued = self.queued.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(StepOutcome::Complete(self.fallback.clone())))
    }
}

/// Widget service module built from scripted steps.
pub struct WidgetModule {
    sequences: HashMap<LifecycleOperation, Vec<Arc<ScriptedStep>>>,
}

impl ServiceModule for WidgetModule {
    fn service_id(&self) -> &str {
        SERVICE
    }

    fn plan_ids(&self) -> Vec<String> {
        vec![PLAN.to_string()]
    }

    fn codec(&self) -> Arc<dyn ShapeCodec> {
        Arc::new(WidgetCodec::new())
    }

    fn sequence(
        &self,
        _plan_id: &str,
        operation: LifecycleOperation,
    ) -> std::result::Result<Option<StepSequence>, SequenceError> {
        let Some(steps) = self.sequences.get(&operation) else {
            return Ok(None);
        };
        let mut builder = StepSequence::builder(format!("{}/{}", SERVICE, operation));
        for step in steps {
            builder = builder.shared_step(step.clone());
        }
        builder.build().map(Some)
    }

    fn credentials(&self, instance: &InstanceRecord) -> Result<Credentials> {
        let typed = WidgetCodec::new().decode(instance)?;
        Credentials::from_typed(&json!({
            "endpoint": typed.details.endpoint,
            "password": typed.secure.password,
        }))
    }
}

/// Executor, persistence and scripted steps for one test.
pub struct Harness {
    pub persistence: Arc<dyn Persistence>,
    pub executor: Arc<WorkflowExecutor>,
    pub log: CallLog,
    steps: HashMap<String, Arc<ScriptedStep>>,
}

impl Harness {
    /// Provision: preProvision, deployARMTemplate.
    /// Deprovision: deleteARMDeployment, deleteWidget.
    /// Bind: rotatePassword.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        Self::with_persistence(Arc::new(MemoryPersistence::new()), config)
    }

    pub fn with_persistence(persistence: Arc<dyn Persistence>, config: ExecutorConfig) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let step = |name: &str, output: StepOutput| ScriptedStep::new(name, log.clone(), output);

        let pre = step(
            "preProvision",
            StepOutput::new().with_details(details(json!({"widgetName": "widget-1"}))),
        );
        let deploy = step(
            "deployARMTemplate",
            StepOutput::new()
                .with_details(details(json!({
                    "armDeployment": "deploy-1",
                    "endpoint": "https://widget-1.example.net"
                })))
                .with_secure(secure(json!({"password": "p@ss-1"}))),
        );
        let delete_deployment = step("deleteARMDeployment", StepOutput::new());
        let delete_widget = step("deleteWidget", StepOutput::new());
        let rotate = step(
            "rotatePassword",
            StepOutput::new().with_secure(secure(json!({"password": "p@ss-2"}))),
        );

        let mut sequences = HashMap::new();
        sequences.insert(
            LifecycleOperation::Provision,
            vec![pre.clone(), deploy.clone()],
        );
        sequences.insert(
            LifecycleOperation::Deprovision,
            vec![delete_deployment.clone(), delete_widget.clone()],
        );
        sequences.insert(LifecycleOperation::Bind, vec![rotate.clone()]);

        let registry = ServiceRegistry::builder()
            .register(Arc::new(WidgetModule { sequences }))
            .build()
            .expect("widget registry should be valid");

        let executor = Arc::new(WorkflowExecutor::new(
            persistence.clone(),
            Arc::new(registry),
            config,
        ));

        let steps = [pre, deploy, delete_deployment, delete_widget, rotate]
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();

        Self {
            persistence,
            executor,
            log,
            steps,
        }
    }

    pub fn step(&self, name: &str) -> &Arc<ScriptedStep> {
        self.steps
            .get(name)
            .unwrap_or_else(|| panic!("no scripted step named {}", name))
    }

    /// Step names invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|c| c.step.clone()).collect()
    }

    pub fn call_log(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.log.lock().unwrap().clear();
    }

    pub async fn load(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.executor.instance(instance_id).await.expect("load")
    }

    /// Provision a fresh instance to completion and clear the call log.
    pub async fn provisioned(&self) -> InstanceRecord {
        let id = new_id();
        let execution = self
            .executor
            .provision(request(&id), Default::default())
            .await
            .expect("provision should succeed");
        assert!(execution.done);
        self.clear_calls();
        let record = self.load(&id).await.expect("record exists");
        assert_eq!(record.status, InstanceStatus::Provisioned);
        record
    }
}

/// Short backoff and a one minute operation timeout.
pub fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        operation_timeout: Duration::from_secs(60),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn request(instance_id: &str) -> ProvisionRequest {
    ProvisionRequest::new(instance_id, SERVICE, PLAN).in_location("westeurope", "rg-test")
}

pub fn hard(message: &str) -> StepResult {
    Err(StepError::hard(message))
}

pub fn transient(message: &str) -> StepResult {
    Err(StepError::transient(message))
}
