//! Resolution of operator records to concrete implementations.
//!
//! Resolution walks an ordered list of candidate engines (explicit engines on
//! the record, then per-operator preferences, then per-device preferences) and
//! falls back to the default implementation. An implementation that declines
//! a record with [`RuntimeError::UnsupportedFeature`] passes to the next
//! candidate; any other construction failure aborts resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::operator::{Operator, OperatorContext};
use crate::record::{DeviceType, OperatorRecord};
use crate::registry::{registry_key, DeviceRegistry};
use crate::schema::SchemaRegistry;
use crate::scope::Scope;

/// Default cap on the engine name stamped on an operator instance.
pub const DEFAULT_MAX_ENGINE_NAME_LENGTH: usize = 10;

/// Ordered engine preferences, per operator type and per device.
///
/// Preferences are fixed once attached to a factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnginePreferences {
    #[serde(default)]
    per_op: BTreeMap<DeviceType, BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    global: BTreeMap<DeviceType, Vec<String>>,
}

impl EnginePreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferred engines for `op_type` on `device`, replacing earlier entries.
    pub fn prefer_for_op<I, S>(mut self, device: DeviceType, op_type: impl Into<String>, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.per_op
            .entry(device)
            .or_default()
            .insert(op_type.into(), engines.into_iter().map(Into::into).collect());
        self
    }

    /// Preferred engines for every operator on `device`.
    pub fn prefer_for_device<I, S>(mut self, device: DeviceType, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global
            .insert(device, engines.into_iter().map(Into::into).collect());
        self
    }

    /// Engines preferred for one operator type on `device`, in order.
    pub fn per_op(&self, device: DeviceType, op_type: &str) -> &[String] {
        self.per_op
            .get(&device)
            .and_then(|ops| ops.get(op_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Engines preferred for every operator on `device`, in order.
    pub fn global(&self, device: DeviceType) -> &[String] {
        self.global.get(&device).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.per_op.is_empty() && self.global.is_empty()
    }

    /// Rejects preferences that name unregistered devices or operator types.
    pub fn validate(&self, devices: &DeviceRegistry) -> Result<()> {
        for (device, ops) in &self.per_op {
            let registry = devices.registry(*device)?;
            for op_type in ops.keys() {
                if !registry.has_op_type(op_type) {
                    return Err(RuntimeError::InvalidEnginePreference(format!(
                        "operator type '{op_type}' is not registered on device {device}"
                    )));
                }
            }
        }
        for device in self.global.keys() {
            devices.registry(*device)?;
        }
        Ok(())
    }
}

/// Per-device registries plus the schema table and resolution policy.
pub struct OperatorFactory {
    devices: DeviceRegistry,
    schemas: SchemaRegistry,
    preferences: EnginePreferences,
    disable_implicit_preference: bool,
    max_engine_name_length: usize,
}

impl OperatorFactory {
    /// Builds a factory, validating `preferences` against `devices`.
    pub fn new(
        devices: DeviceRegistry,
        schemas: SchemaRegistry,
        preferences: EnginePreferences,
    ) -> Result<Self> {
        preferences.validate(&devices)?;
        Ok(OperatorFactory {
            devices,
            schemas,
            preferences,
            disable_implicit_preference: false,
            max_engine_name_length: DEFAULT_MAX_ENGINE_NAME_LENGTH,
        })
    }

    pub fn with_implicit_preference_disabled(mut self, disabled: bool) -> Self {
        self.disable_implicit_preference = disabled;
        self
    }

    pub fn with_max_engine_name_length(mut self, length: usize) -> Self {
        self.max_engine_name_length = length;
        self
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn preferences(&self) -> &EnginePreferences {
        &self.preferences
    }

    /// Candidate engines for `record`, in the order they are tried.
    pub fn candidate_engines(&self, record: &OperatorRecord) -> Vec<String> {
        let device = record.device_type();
        let mut engines = record.engines();
        if !self.disable_implicit_preference {
            engines.extend(self.preferences.per_op(device, &record.op_type).iter().cloned());
            engines.extend(self.preferences.global(device).iter().cloned());
        }
        engines
    }

    /// Resolves and constructs the operator for `record` inside `scope`.
    ///
    /// `position` is the record's index within its graph, if any. On failure
    /// it is stored as the scope's last failed position.
    pub fn create_operator(
        &self,
        record: Arc<OperatorRecord>,
        scope: &Arc<Scope>,
        position: Option<usize>,
    ) -> Result<Box<dyn Operator>> {
        match self.resolve(record, scope) {
            Ok(mut op) => {
                op.base_mut().set_net_position(position);
                Ok(op)
            }
            Err(err) => {
                match position {
                    Some(position) => {
                        debug!(position, "operator constructor failed");
                        scope.set_last_failed_op_position(position);
                    }
                    None => debug!("failed operator constructor has no graph position"),
                }
                Err(err)
            }
        }
    }

    fn resolve(&self, record: Arc<OperatorRecord>, scope: &Arc<Scope>) -> Result<Box<dyn Operator>> {
        let op_type = record.op_type.as_str();
        match self.schemas.get(op_type) {
            Some(schema) => schema.verify(&record)?,
            None => warn!(op_type, "no operator schema registered; skipping schema check"),
        }

        let device = record.device_type();
        let registry = self.devices.registry(device)?;

        for engine in self.candidate_engines(&record) {
            let key = registry_key(op_type, &engine);
            let Some(builder) = registry.get(&key) else {
                info!(op_type, engine = %engine, "engine is not available for operator");
                continue;
            };
            debug!(op_type, key = %key, "trying engine");
            match builder(OperatorContext {
                record: Arc::clone(&record),
                scope,
            }) {
                Ok(mut op) => {
                    let stamped: String = engine.chars().take(self.max_engine_name_length).collect();
                    op.base_mut().set_engine(stamped);
                    return Ok(op);
                }
                Err(err) if err.is_unsupported_feature() => {
                    warn!(
                        op_type,
                        engine = %engine,
                        error = %err,
                        record = %record.debug_string(),
                        "engine declined record"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        debug!(op_type, "using default implementation");
        let builder = registry
            .get(op_type)
            .ok_or_else(|| RuntimeError::OperatorNotFound {
                op_type: op_type.to_string(),
                device,
            })?;
        builder(OperatorContext {
            record: Arc::clone(&record),
            scope,
        })
    }
}
