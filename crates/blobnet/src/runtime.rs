//! The runtime bundle shared by every scope in a tree.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::factory::{EnginePreferences, OperatorFactory};
use crate::graph::{GraphBuilder, GraphRegistry};
use crate::operator::OperatorBuilder;
use crate::record::DeviceType;
use crate::registry::DeviceRegistry;
use crate::schema::{OpSchema, SchemaRegistry};
use crate::scope::Scope;

/// Operator factory, graph constructors and configuration.
///
/// Immutable once built; tests construct a fresh runtime per case.
pub struct Runtime {
    factory: OperatorFactory,
    graphs: GraphRegistry,
    config: RuntimeConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Runtime with only the built-in operators and default configuration.
    pub fn new_default() -> Result<Arc<Runtime>> {
        RuntimeBuilder::new().build()
    }

    /// Factory resolving operator records to implementations.
    pub fn factory(&self) -> &OperatorFactory {
        &self.factory
    }

    /// Registered graph runtimes by type name.
    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// New root scope bound to this runtime.
    pub fn root_scope(self: &Arc<Self>) -> Arc<Scope> {
        Scope::new(Arc::clone(self))
    }
}

/// Mutable registries and configuration, frozen into a [`Runtime`] by `build`.
pub struct RuntimeBuilder {
    devices: DeviceRegistry,
    schemas: SchemaRegistry,
    graphs: GraphRegistry,
    preferences: EnginePreferences,
    config: RuntimeConfig,
    builtin_operators: bool,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Starts with the CPU device and the sequential graph runtimes registered.
    pub fn new() -> Self {
        let mut devices = DeviceRegistry::new();
        devices.register_device(DeviceType::CPU);
        RuntimeBuilder {
            devices,
            schemas: SchemaRegistry::new(),
            graphs: GraphRegistry::with_defaults(),
            preferences: EnginePreferences::default(),
            config: RuntimeConfig::default(),
            builtin_operators: true,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_preferences(mut self, preferences: EnginePreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Leaves out the recurrent operators normally registered on build.
    pub fn without_builtin_operators(mut self) -> Self {
        self.builtin_operators = false;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn register_device(&mut self, device: DeviceType) -> &mut Self {
        self.devices.register_device(device);
        self
    }

    /// Registers the default implementation of `op_type` on `device`.
    pub fn register_operator(
        &mut self,
        device: DeviceType,
        op_type: &str,
        builder: OperatorBuilder,
    ) -> Result<&mut Self> {
        self.devices.register_operator(device, op_type, "", builder)?;
        Ok(self)
    }

    /// Registers the `engine` implementation of `op_type` on `device`.
    pub fn register_engine(
        &mut self,
        device: DeviceType,
        op_type: &str,
        engine: &str,
        builder: OperatorBuilder,
    ) -> Result<&mut Self> {
        self.devices
            .register_operator(device, op_type, engine, builder)?;
        Ok(self)
    }

    /// Adds a schema; a later schema for the same type replaces the earlier one.
    pub fn register_schema(&mut self, schema: OpSchema) -> &mut Self {
        self.schemas.register(schema);
        self
    }

    pub fn register_graph_type(&mut self, graph_type: &str, builder: GraphBuilder) -> &mut Self {
        self.graphs.register(graph_type, builder);
        self
    }

    pub fn build(mut self) -> Result<Arc<Runtime>> {
        self.config.validate()?;
        if self.builtin_operators {
            crate::recurrent::register_operators(&mut self)?;
        }
        let factory = OperatorFactory::new(self.devices, self.schemas, self.preferences)?
            .with_implicit_preference_disabled(self.config.disable_implicit_engine_preference)
            .with_max_engine_name_length(self.config.max_engine_name_length);
        debug!(
            devices = factory.devices().devices().count(),
            schemas = factory.schemas().len(),
            "runtime built"
        );
        Ok(Arc::new(Runtime {
            factory,
            graphs: self.graphs,
            config: self.config,
        }))
    }
}
