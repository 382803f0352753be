//! Two-level operator registry: device type, then operator key.
//!
//! Keys are the bare type name for the default implementation and
//! `<type>_ENGINE_<engine>` for alternates.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::operator::OperatorBuilder;
use crate::record::DeviceType;

/// Engine marker that selects the bare type implementation.
pub const DEFAULT_ENGINE: &str = "DEFAULT";

/// Registry key for `op_type` implemented by `engine`.
pub fn registry_key(op_type: &str, engine: &str) -> String {
    if engine.is_empty() || engine == DEFAULT_ENGINE {
        op_type.to_string()
    } else {
        format!("{op_type}_ENGINE_{engine}")
    }
}

/// Builders for the operators available on one device type.
#[derive(Default)]
pub struct OperatorRegistry {
    device: DeviceType,
    builders: HashMap<String, OperatorBuilder>,
}

impl OperatorRegistry {
    pub fn new(device: DeviceType) -> Self {
        OperatorRegistry {
            device,
            builders: HashMap::new(),
        }
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    pub fn register(&mut self, key: impl Into<String>, builder: OperatorBuilder) -> Result<()> {
        let key = key.into();
        if self.builders.contains_key(&key) {
            return Err(RuntimeError::DuplicateOperator {
                key,
                device: self.device,
            });
        }
        debug!(device = %self.device, key = %key, "registered operator");
        self.builders.insert(key, builder);
        Ok(())
    }

    /// Builder stored under an exact registry key.
    pub fn get(&self, key: &str) -> Option<&OperatorBuilder> {
        self.builders.get(key)
    }

    /// Whether an exact registry key is taken.
    pub fn contains(&self, key: &str) -> bool {
        self.builders.contains_key(key)
    }

    /// Whether any implementation (default or engine-specific) exists for `op_type`.
    pub fn has_op_type(&self, op_type: &str) -> bool {
        let engine_prefix = format!("{op_type}_ENGINE_");
        self.builders
            .keys()
            .any(|key| key == op_type || key.starts_with(&engine_prefix))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.builders.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Maps device-type tags to their operator registries.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceType, OperatorRegistry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty registry for `device`; existing registries are kept.
    pub fn register_device(&mut self, device: DeviceType) {
        self.devices
            .entry(device)
            .or_insert_with(|| OperatorRegistry::new(device));
    }

    pub fn has_device(&self, device: DeviceType) -> bool {
        self.devices.contains_key(&device)
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceType> + '_ {
        self.devices.keys().copied()
    }

    /// Operator registry of `device`, or `UnknownDeviceType`.
    pub fn registry(&self, device: DeviceType) -> Result<&OperatorRegistry> {
        self.devices
            .get(&device)
            .ok_or(RuntimeError::UnknownDeviceType(device))
    }

    pub fn registry_mut(&mut self, device: DeviceType) -> Result<&mut OperatorRegistry> {
        self.devices
            .get_mut(&device)
            .ok_or(RuntimeError::UnknownDeviceType(device))
    }

    /// Registers `builder` for `op_type` on `device`, under `engine` when non-empty.
    pub fn register_operator(
        &mut self,
        device: DeviceType,
        op_type: &str,
        engine: &str,
        builder: OperatorBuilder,
    ) -> Result<()> {
        self.registry_mut(device)?
            .register(registry_key(op_type, engine), builder)
    }
}
