// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service module registry.
//!
//! Service modules are registered once at startup. The registry materialises
//! every (plan, operation) sequence each module declares, validates it, and
//! from then on answers lookups without touching module code. It is passed by
//! reference to the executor and the poller; there is no global instance.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::codec::{Credentials, ShapeCodec};
use crate::error::{CoreError, Result};
use crate::instance::{InstanceRecord, InstanceStatus, LifecycleOperation};
use crate::sequence::{SequenceError, StepSequence};

/// A service offered by the broker, together with its steps and shapes.
pub trait ServiceModule: Send + Sync {
    /// Catalog service ID.
    fn service_id(&self) -> &str;

    /// Catalog plan IDs this module serves.
    fn plan_ids(&self) -> Vec<String>;

    /// Codec for the module's detail shapes.
    fn codec(&self) -> Arc<dyn ShapeCodec>;

    /// Step sequence for one plan and operation.
    ///
    /// `Ok(None)` means the module does not support the operation for the
    /// plan; an `Err` is a configuration error reported at startup.
    fn sequence(
        &self,
        plan_id: &str,
        operation: LifecycleOperation,
    ) -> std::result::Result<Option<StepSequence>, SequenceError>;

    /// Build caller-facing credentials from a provisioned instance.
    fn credentials(&self, instance: &InstanceRecord) -> Result<Credentials>;
}

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two modules claim the same service ID.
    #[error("service '{0}' registered twice")]
    DuplicateService(String),

    /// Two modules use the same detail shape kind.
    #[error("detail kind '{kind}' used by both '{first}' and '{second}'")]
    DuplicateKind {
        /// Shape kind.
        kind: String,
        /// First module.
        first: String,
        /// Second module.
        second: String,
    },

    /// A module declared no plans.
    #[error("service '{0}' declares no plans")]
    NoPlans(String),

    /// A module has no provision sequence for one of its plans.
    #[error("service '{service_id}' plan '{plan_id}' has no provision sequence")]
    MissingProvision {
        /// Service ID.
        service_id: String,
        /// Plan ID.
        plan_id: String,
    },

    /// A declared sequence is malformed.
    #[error("service '{service_id}' plan '{plan_id}' {operation}: {source}")]
    InvalidSequence {
        /// Service ID.
        service_id: String,
        /// Plan ID.
        plan_id: String,
        /// Operation.
        operation: LifecycleOperation,
        /// Underlying problem.
        #[source]
        source: SequenceError,
    },
}

struct RegisteredService {
    module: Arc<dyn ServiceModule>,
    codec: Arc<dyn ShapeCodec>,
    sequences: HashMap<(String, LifecycleOperation), StepSequence>,
}

/// Immutable lookup table of service modules and their sequences.
pub struct ServiceRegistry {
    services: HashMap<String, RegisteredService>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.services.keys().collect();
        ids.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &ids)
            .finish()
    }
}

impl ServiceRegistry {
    /// Start building a registry.
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            modules: Vec::new(),
        }
    }

    /// Registered service IDs, sorted.
    pub fn service_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.services.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Look up the sequence for a (service, plan, operation) triple.
    pub fn sequence(
        &self,
        service_id: &str,
        plan_id: &str,
        operation: LifecycleOperation,
    ) -> Result<&StepSequence> {
        let service = self.service(service_id)?;
        service
            .sequences
            .get(&(plan_id.to_string(), operation))
            .ok_or_else(|| CoreError::NoSequence {
                service_id: service_id.to_string(),
                plan_id: plan_id.to_string(),
                operation: operation.as_str().to_string(),
            })
    }

    /// True when the triple has a registered sequence.
    pub fn supports(&self, service_id: &str, plan_id: &str, operation: LifecycleOperation) -> bool {
        self.sequence(service_id, plan_id, operation).is_ok()
    }

    /// Shape codec of a service.
    pub fn codec(&self, service_id: &str) -> Result<&dyn ShapeCodec> {
        Ok(self.service(service_id)?.codec.as_ref())
    }

    /// Produce bind-time credentials.
    ///
    /// Only instances that have reached `provisioned` and have no operation
    /// in flight yield credentials.
    pub fn credentials(&self, instance: &InstanceRecord) -> Result<Credentials> {
        if instance.status != InstanceStatus::Provisioned || instance.is_in_progress() {
            return Err(CoreError::InvalidInstanceState {
                instance_id: instance.instance_id.clone(),
                expected: InstanceStatus::Provisioned.as_str().to_string(),
                actual: instance.status.as_str().to_string(),
            });
        }
        let service = self.service(&instance.service_id)?;
        service
            .codec
            .validate(&instance.details, &instance.secure_details)?;
        service.module.credentials(instance)
    }

    fn service(&self, service_id: &str) -> Result<&RegisteredService> {
        self.services
            .get(service_id)
            .ok_or_else(|| CoreError::UnknownService {
                service_id: service_id.to_string(),
            })
    }
}

/// Builder for [`ServiceRegistry`].
pub struct ServiceRegistryBuilder {
    modules: Vec<Arc<dyn ServiceModule>>,
}

impl ServiceRegistryBuilder {
    /// Add a service module.
    pub fn register(mut self, module: Arc<dyn ServiceModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Materialise and validate every sequence.
    pub fn build(self) -> std::result::Result<ServiceRegistry, RegistryError> {
        let mut services = HashMap::new();
        let mut kinds: HashMap<&'static str, String> = HashMap::new();

        for module in self.modules {
            let service_id = module.service_id().to_string();
            if services.contains_key(&service_id) {
                return Err(RegistryError::DuplicateService(service_id));
            }

            let codec = module.codec();
            if let Some(first) = kinds.insert(codec.kind(), service_id.clone()) {
                return Err(RegistryError::DuplicateKind {
                    kind: codec.kind().to_string(),
                    first,
                    second: service_id,
                });
            }

            let plans: HashSet<String> = module.plan_ids().into_iter().collect();
            if plans.is_empty() {
                return Err(RegistryError::NoPlans(service_id));
            }

            let mut sequences = HashMap::new();
            for plan_id in &plans {
                for operation in LifecycleOperation::ALL {
                    let sequence = module.sequence(plan_id, operation).map_err(|source| {
                        RegistryError::InvalidSequence {
                            service_id: service_id.clone(),
                            plan_id: plan_id.clone(),
                            operation,
                            source,
                        }
                    })?;
                    if let Some(sequence) = sequence {
                        debug!(
                            service_id = %service_id,
                            plan_id = %plan_id,
                            operation = %operation,
                            steps = ?sequence.step_names(),
                            "Registered step sequence"
                        );
                        sequences.insert((plan_id.clone(), operation), sequence);
                    }
                }
                if !sequences.contains_key(&(plan_id.clone(), LifecycleOperation::Provision)) {
                    return Err(RegistryError::MissingProvision {
                        service_id,
                        plan_id: plan_id.clone(),
                    });
                }
            }

            services.insert(
                service_id,
                RegisteredService {
                    module,
                    codec,
                    sequences,
                },
            );
        }

        Ok(ServiceRegistry { services })
    }
}
