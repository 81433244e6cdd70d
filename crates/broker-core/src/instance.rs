// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance record and its lifecycle vocabulary.
//!
//! An [`InstanceRecord`] is the only state the engine keeps for a service
//! instance. Everything a step needs in order to resume lives here, so an
//! execution can be suspended indefinitely and picked up by any process.
//!
//! ```text
//!   provision ──► PROVISIONING ──► PROVISIONED ◄─── update/bind/unbind
//!                      │               │   │            (UPDATING, BINDING,
//!                      │               │   └──────────►  UNBINDING)
//!                      ▼               ▼
//!                   FAILED ◄──── DEPROVISIONING ──► (record deleted)
//! ```

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Provisioning sequence is running.
    Provisioning,
    /// Provisioned and idle.
    Provisioned,
    /// Deprovisioning sequence is running.
    Deprovisioning,
    /// Deprovisioned. Records in this status are normally deleted.
    Deprovisioned,
    /// Update sequence is running.
    Updating,
    /// Bind sequence is running.
    Binding,
    /// Unbind sequence is running.
    Unbinding,
    /// A step failed, timed out or found corrupt state.
    Failed,
}

impl InstanceStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Provisioned => "provisioned",
            Self::Deprovisioning => "deprovisioning",
            Self::Deprovisioned => "deprovisioned",
            Self::Updating => "updating",
            Self::Binding => "binding",
            Self::Unbinding => "unbinding",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(Self::Provisioning),
            "provisioned" => Some(Self::Provisioned),
            "deprovisioning" => Some(Self::Deprovisioning),
            "deprovisioned" => Some(Self::Deprovisioned),
            "updating" => Some(Self::Updating),
            "binding" => Some(Self::Binding),
            "unbinding" => Some(Self::Unbinding),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True while a step sequence owns the instance.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Provisioning
                | Self::Deprovisioning
                | Self::Updating
                | Self::Binding
                | Self::Unbinding
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle operation with its own step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOperation {
    /// Create backend resources.
    Provision,
    /// Tear backend resources down.
    Deprovision,
    /// Change an already provisioned instance.
    Update,
    /// Produce credentials for a consumer.
    Bind,
    /// Revoke credentials.
    Unbind,
}

impl LifecycleOperation {
    /// Every operation, in registration order.
    pub const ALL: [LifecycleOperation; 5] = [
        Self::Provision,
        Self::Deprovision,
        Self::Update,
        Self::Bind,
        Self::Unbind,
    ];

    /// Returns the string representation of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }

    /// Parse an operation from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provision" => Some(Self::Provision),
            "deprovision" => Some(Self::Deprovision),
            "update" => Some(Self::Update),
            "bind" => Some(Self::Bind),
            "unbind" => Some(Self::Unbind),
            _ => None,
        }
    }

    /// Status the instance carries while this operation runs.
    pub fn working_status(&self) -> InstanceStatus {
        match self {
            Self::Provision => InstanceStatus::Provisioning,
            Self::Deprovision => InstanceStatus::Deprovisioning,
            Self::Update => InstanceStatus::Updating,
            Self::Bind => InstanceStatus::Binding,
            Self::Unbind => InstanceStatus::Unbinding,
        }
    }

    /// Stable status reached when the sequence completes.
    ///
    /// Deprovisioning ends with the record being deleted; the status is only
    /// observable on the returned snapshot.
    pub fn terminal_status(&self) -> InstanceStatus {
        match self {
            Self::Deprovision => InstanceStatus::Deprovisioned,
            _ => InstanceStatus::Provisioned,
        }
    }

    /// Statuses from which this operation may begin.
    pub fn allowed_from(&self) -> &'static [InstanceStatus] {
        match self {
            Self::Provision => &[],
            Self::Deprovision => &[InstanceStatus::Provisioned, InstanceStatus::Failed],
            Self::Update | Self::Bind | Self::Unbind => &[InstanceStatus::Provisioned],
        }
    }
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance ended up in [`InstanceStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step reported a hard backend error.
    Backend,
    /// Stored details did not match the registered shape.
    CorruptState,
    /// An asynchronous operation outlived its deadline.
    Timeout,
}

impl FailureKind {
    /// Returns the string representation of the failure kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::CorruptState => "corrupt_state",
            Self::Timeout => "timeout",
        }
    }

    /// Parse a failure kind from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backend" => Some(Self::Backend),
            "corrupt_state" => Some(Self::CorruptState),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Storage channel a detail bag belongs to.
pub trait Channel: Send + Sync + 'static {
    /// Channel name used in error messages.
    const NAME: &'static str;
    /// Whether `Debug` output must hide field values.
    const REDACTED: bool;
}

/// Channel for fields that may be logged and handed to module logic freely.
#[derive(Debug)]
pub enum Plain {}

/// Channel for access keys, passwords and connection secrets.
#[derive(Debug)]
pub enum Sensitive {}

impl Channel for Plain {
    const NAME: &'static str = "details";
    const REDACTED: bool = false;
}

impl Channel for Sensitive {
    const NAME: &'static str = "secure details";
    const REDACTED: bool = true;
}

/// Polymorphic bag of detail fields, tagged with the shape that wrote it.
///
/// The channel parameter keeps the non-sensitive and sensitive bags apart at
/// compile time: a [`SecureDetailBag`] can never be merged into a
/// [`DetailBag`].
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Bag<C: Channel> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(skip)]
    _channel: PhantomData<fn() -> C>,
}

/// Non-sensitive instance details.
pub type DetailBag = Bag<Plain>;

/// Sensitive instance details, sealed at rest.
pub type SecureDetailBag = Bag<Sensitive>;

impl<C: Channel> Bag<C> {
    /// An untagged, empty bag (a freshly created instance).
    pub fn empty() -> Self {
        Self {
            kind: None,
            fields: Map::new(),
            _channel: PhantomData,
        }
    }

    /// Build a bag tagged with a shape kind.
    pub fn tagged(kind: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            kind: Some(kind.into()),
            fields,
            _channel: PhantomData,
        }
    }

    /// Shape kind that produced the fields, if any.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Raw field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up one field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Field names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// True when untagged and without fields.
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.fields.is_empty()
    }

    /// Merge a step's output into this bag, overwriting fields key by key.
    ///
    /// Fails with `CorruptState` when both bags are tagged with different
    /// shapes; nothing is modified in that case.
    pub fn merge(&mut self, other: Bag<C>) -> Result<()> {
        match (&self.kind, &other.kind) {
            (Some(current), Some(incoming)) if current != incoming => {
                return Err(CoreError::corrupt(format!(
                    "cannot merge {} of kind '{}' into '{}'",
                    C::NAME,
                    incoming,
                    current
                )));
            }
            (None, Some(_)) => self.kind = other.kind,
            _ => {}
        }
        self.fields.extend(other.fields);
        Ok(())
    }
}

impl<C: Channel> Default for Bag<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: Channel> Clone for Bag<C> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            fields: self.fields.clone(),
            _channel: PhantomData,
        }
    }
}

impl<C: Channel> PartialEq for Bag<C> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.fields == other.fields
    }
}

impl<C: Channel> fmt::Debug for Bag<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if C::REDACTED {
            let keys: Vec<&str> = self.keys().collect();
            f.debug_struct("SecureDetailBag")
                .field("kind", &self.kind)
                .field("fields", &keys)
                .field("values", &"<redacted>")
                .finish()
        } else {
            f.debug_struct("DetailBag")
                .field("kind", &self.kind)
                .field("fields", &self.fields)
                .finish()
        }
    }
}

/// Persisted state of one service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub instance_id: String,
    /// Catalog service this instance belongs to.
    pub service_id: String,
    /// Catalog plan within the service.
    pub plan_id: String,
    /// Region backend resources are created in.
    pub location: String,
    /// Resource group backend resources are created in.
    pub resource_group: String,
    /// Non-sensitive provisioning parameters supplied with the request.
    pub parameters: Map<String, Value>,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Operation whose sequence currently owns the instance.
    pub operation: Option<LifecycleOperation>,
    /// Index of the next step to run within that sequence.
    pub step_index: usize,
    /// Non-sensitive details accumulated by steps.
    pub details: DetailBag,
    /// Sensitive details accumulated by steps.
    pub secure_details: SecureDetailBag,
    /// Backend token of an in-flight asynchronous operation.
    pub operation_token: Option<String>,
    /// When the in-flight step stops being waited for.
    pub operation_deadline: Option<DateTime<Utc>>,
    /// Earliest time the poller should resume this instance.
    pub next_poll_at: Option<DateTime<Utc>>,
    /// Resumes of the current step so far (drives backoff).
    pub poll_attempts: u32,
    /// Human-readable cause of the last failure or retry.
    pub status_reason: Option<String>,
    /// Classification of a terminal failure.
    pub failure_kind: Option<FailureKind>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last saved.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// True while an operation's sequence has not finished.
    pub fn is_in_progress(&self) -> bool {
        self.operation.is_some()
    }

    /// True when parked on a backend operation.
    pub fn is_awaiting_backend(&self) -> bool {
        self.operation_token.is_some()
    }

    /// Reset per-step bookkeeping after a step commits or an operation starts.
    pub(crate) fn clear_step_bookkeeping(&mut self) {
        self.operation_token = None;
        self.operation_deadline = None;
        self.next_poll_at = None;
        self.poll_attempts = 0;
    }

    /// Move to `failed`, keeping details exactly as they were.
    pub(crate) fn mark_failed(&mut self, kind: FailureKind, reason: String) {
        self.status = InstanceStatus::Failed;
        self.failure_kind = Some(kind);
        self.status_reason = Some(reason);
        self.operation = None;
        self.step_index = 0;
        self.clear_step_bookkeeping();
    }
}

/// Request to provision a new instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Instance ID chosen by the platform.
    pub instance_id: String,
    /// Catalog service ID.
    pub service_id: String,
    /// Catalog plan ID.
    pub plan_id: String,
    /// Region for backend resources.
    pub location: String,
    /// Resource group for backend resources.
    pub resource_group: String,
    /// Non-sensitive provisioning parameters.
    pub parameters: Map<String, Value>,
}

impl ProvisionRequest {
    /// Create a request without parameters.
    pub fn new(
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            location: String::new(),
            resource_group: String::new(),
            parameters: Map::new(),
        }
    }

    /// Set location and resource group.
    pub fn in_location(
        mut self,
        location: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Self {
        self.location = location.into();
        self.resource_group = resource_group.into();
        self
    }

    /// Add one provisioning parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Validate and turn into a fresh record in `provisioning`.
    pub fn into_record(self) -> Result<InstanceRecord> {
        for (field, value) in [
            ("instance_id", &self.instance_id),
            ("service_id", &self.service_id),
            ("plan_id", &self.plan_id),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::ValidationError {
                    field: field.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }

        let now = Utc::now();
        Ok(InstanceRecord {
            instance_id: self.instance_id,
            service_id: self.service_id,
            plan_id: self.plan_id,
            location: self.location,
            resource_group: self.resource_group,
            parameters: self.parameters,
            status: InstanceStatus::Provisioning,
            operation: Some(LifecycleOperation::Provision),
            step_index: 0,
            details: DetailBag::empty(),
            secure_details: SecureDetailBag::empty(),
            operation_token: None,
            operation_deadline: None,
            next_poll_at: None,
            poll_attempts: 0,
            status_reason: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
        })
    }
}
