// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed (de)serialization of instance details.
//!
//! Each service module declares one non-sensitive shape ([`DetailShape`]) and
//! one sensitive shape ([`SecretShape`]). A [`DetailCodec`] moves them in and
//! out of the generic [`DetailBag`]/[`SecureDetailBag`] storage and refuses to
//! decode a bag written by a different shape.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::instance::{Bag, Channel, DetailBag, InstanceRecord, SecureDetailBag};
use crate::step::StepOutput;

/// Non-sensitive detail structure of one service module.
pub trait DetailShape: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Tag written next to the fields; must be unique per module.
    const KIND: &'static str;
}

/// Sensitive detail structure of one service module.
pub trait SecretShape: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Tag written next to the fields; must be unique per module.
    const KIND: &'static str;
}

/// Type-erased shape check, dispatched through the service registry.
pub trait ShapeCodec: Send + Sync {
    /// Kind tag of the non-sensitive shape.
    fn kind(&self) -> &'static str;

    /// Fail with `CorruptState` unless both bags decode into the module's shapes.
    fn validate(&self, details: &DetailBag, secure: &SecureDetailBag) -> Result<()>;
}

/// Decoded details of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Typed<D, S> {
    /// Non-sensitive details.
    pub details: D,
    /// Sensitive details.
    pub secure: S,
}

/// Codec for the (details, secure details) pair of one service module.
pub struct DetailCodec<D, S> {
    _shapes: PhantomData<fn() -> (D, S)>,
}

impl<D, S> fmt::Debug for DetailCodec<D, S>
where
    D: DetailShape,
    S: SecretShape,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetailCodec")
            .field("details", &D::KIND)
            .field("secure", &S::KIND)
            .finish()
    }
}

impl<D: DetailShape, S: SecretShape> Default for DetailCodec<D, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DetailShape, S: SecretShape> Clone for DetailCodec<D, S> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<D: DetailShape, S: SecretShape> DetailCodec<D, S> {
    /// Create a codec.
    pub fn new() -> Self {
        Self {
            _shapes: PhantomData,
        }
    }

    /// Encode non-sensitive details.
    pub fn encode(&self, details: &D) -> Result<DetailBag> {
        Ok(DetailBag::tagged(D::KIND, to_fields(details, D::KIND)?))
    }

    /// Encode sensitive details.
    pub fn encode_secure(&self, secure: &S) -> Result<SecureDetailBag> {
        Ok(SecureDetailBag::tagged(S::KIND, to_fields(secure, S::KIND)?))
    }

    /// Encode both shapes as a step output.
    pub fn output(&self, details: &D, secure: &S) -> Result<StepOutput> {
        let details = self.encode(details)?;
        let secure = self.encode_secure(secure)?;
        ensure_disjoint(&details, &secure)?;
        Ok(StepOutput::new().with_details(details).with_secure(secure))
    }

    /// Encode only the non-sensitive shape as a step output.
    pub fn details_output(&self, details: &D) -> Result<StepOutput> {
        Ok(StepOutput::new().with_details(self.encode(details)?))
    }

    /// Decode non-sensitive details. An empty bag decodes to `D::default()`.
    pub fn decode_details(&self, bag: &DetailBag) -> Result<D> {
        from_bag(D::KIND, bag)
    }

    /// Decode sensitive details. An empty bag decodes to `S::default()`.
    pub fn decode_secure(&self, bag: &SecureDetailBag) -> Result<S> {
        from_bag(S::KIND, bag)
    }

    /// Decode both bags of an instance.
    pub fn decode(&self, instance: &InstanceRecord) -> Result<Typed<D, S>> {
        Ok(Typed {
            details: self.decode_details(&instance.details)?,
            secure: self.decode_secure(&instance.secure_details)?,
        })
    }
}

impl<D: DetailShape, S: SecretShape> ShapeCodec for DetailCodec<D, S> {
    fn kind(&self) -> &'static str {
        D::KIND
    }

    fn validate(&self, details: &DetailBag, secure: &SecureDetailBag) -> Result<()> {
        self.decode_details(details)?;
        self.decode_secure(secure)?;
        ensure_disjoint(details, secure)
    }
}

/// Fail when a field name appears in both the plain and the sensitive bag.
pub fn ensure_disjoint(details: &DetailBag, secure: &SecureDetailBag) -> Result<()> {
    if let Some(key) = details.keys().find(|k| secure.get(k).is_some()) {
        return Err(CoreError::corrupt(format!(
            "field '{}' present in both details and secure details",
            key
        )));
    }
    Ok(())
}

fn to_fields<T: Serialize, K: fmt::Display>(value: &T, kind: K) -> Result<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(CoreError::corrupt(format!(
            "shape '{}' must serialize to an object, got {}",
            kind, other
        ))),
        Err(e) => Err(CoreError::corrupt(format!(
            "failed to encode shape '{}': {}",
            kind, e
        ))),
    }
}

fn from_bag<T: DeserializeOwned + Default, C: Channel>(expected: &str, bag: &Bag<C>) -> Result<T> {
    if bag.is_empty() {
        return Ok(T::default());
    }
    match bag.kind() {
        Some(kind) if kind == expected => {}
        Some(kind) => {
            return Err(CoreError::corrupt(format!(
                "{} of kind '{}' cannot be decoded as '{}'",
                C::NAME,
                kind,
                expected
            )));
        }
        None => {
            return Err(CoreError::corrupt(format!(
                "untagged {} cannot be decoded as '{}'",
                C::NAME,
                expected
            )));
        }
    }
    serde_json::from_value(Value::Object(bag.fields().clone())).map_err(|e| {
        CoreError::corrupt(format!(
            "{} do not match shape '{}': {}",
            C::NAME,
            expected,
            e
        ))
    })
}

/// Caller-facing credentials produced at bind time.
///
/// `Debug` never prints the values.
#[derive(Clone, PartialEq)]
pub struct Credentials(Value);

impl Credentials {
    /// Build credentials from a module's typed credentials structure.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| CoreError::corrupt(format!("failed to encode credentials: {}", e)))?;
        Ok(Self(value))
    }

    /// Parse into a typed structure.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.0.clone())
            .map_err(|e| CoreError::corrupt(format!("credentials do not match: {}", e)))
    }

    /// Borrow the raw JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the raw JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}
