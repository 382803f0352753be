//! Execution runtime for dataflow graphs.
//!
//! A [`Scope`] owns named [`Blob`]s and graph instances and reads through to
//! its parent. The [`OperatorFactory`] resolves [`OperatorRecord`]s to
//! device- and engine-specific implementations, and the [`recurrent`] module
//! unrolls a step graph across timesteps with per-timestep scopes.

pub mod blob;
pub mod config;
pub mod error;
pub mod factory;
pub mod graph;
pub mod operator;
pub mod record;
pub mod recurrent;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod scope;
pub mod tensor;

pub use blob::{Blob, BlobRef, BlobValue};
pub use config::{ExecutorConfig, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use factory::{EnginePreferences, OperatorFactory};
pub use graph::{Graph, GraphBuilder, GraphRegistry, SimpleGraph};
pub use operator::{builder, Operator, OperatorBase, OperatorBuilder, OperatorContext, RunObserver};
pub use record::{ArgValue, Argument, DeviceOption, DeviceType, FromArg, GraphRecord, OperatorRecord};
pub use registry::{registry_key, DeviceRegistry, OperatorRegistry};
pub use runtime::{Runtime, RuntimeBuilder};
pub use schema::{OpSchema, SchemaRegistry};
pub use scope::{GraphHandle, Scope};
pub use tensor::{DType, Element, Shape, Tensor};
