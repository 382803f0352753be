//! Error taxonomy shared by the scope, factory, graph and recurrent layers.

use thiserror::Error;

use crate::record::DeviceType;

/// Errors surfaced by the runtime.
///
/// Configuration errors are always fatal. `UnsupportedFeature` is the only
/// recoverable variant: the factory treats it as "try the next engine".
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("device type {0} is not registered")]
    UnknownDeviceType(DeviceType),

    #[error(
        "cannot create operator of type '{op_type}' on device '{device}': no implementation \
         is registered for that device"
    )]
    OperatorNotFound { op_type: String, device: DeviceType },

    #[error("operator key '{key}' is already registered for device '{device}'")]
    DuplicateOperator { key: String, device: DeviceType },

    #[error("operator '{op_type}' does not support the requested feature: {reason}")]
    UnsupportedFeature { op_type: String, reason: String },

    #[error("operator '{op_type}' did not pass schema checking: {detail}")]
    SchemaViolation { op_type: String, detail: String },

    #[error("invalid engine preference: {0}")]
    InvalidEnginePreference(String),

    #[error(
        "refusing to overwrite existing graph '{0}' unless overwrite is requested explicitly"
    )]
    DuplicateGraphName(String),

    #[error("graph type '{graph_type}' is not registered or failed to construct")]
    UnknownGraphType {
        graph_type: String,
        /// Construction failure of a registered type; `None` when the type is unknown.
        #[source]
        source: Option<Box<RuntimeError>>,
    },

    #[error("graph definition must carry a non-empty name")]
    MissingGraphName,

    #[error("graph '{0}' does not exist in this scope")]
    GraphNotFound(String),

    #[error("operator '{op_type}': input blob '{blob}' does not exist")]
    MissingInput { op_type: String, blob: String },

    #[error("blob '{0}' does not exist")]
    MissingBlob(String),

    #[error("graph '{graph}': declared external input '{blob}' is neither in scope nor produced")]
    UnknownExternalInput { graph: String, blob: String },

    #[error("graph '{graph}': operator '{op_type}' reads '{blob}' whose source is unknown")]
    UnknownInputSource {
        graph: String,
        op_type: String,
        blob: String,
    },

    #[error("graph '{graph}': declared outputs are never produced: {blobs:?}")]
    UnproducedExternalOutput { graph: String, blobs: Vec<String> },

    #[error("argument lists have mismatched lengths: {0}")]
    ArgumentMismatch(String),

    #[error("argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("blob '{blob}': {reason}")]
    TypeMismatch { blob: String, reason: String },

    #[error(
        "timesteps {first} and {second} share a step scope but may run concurrently \
         (at most {window} timesteps in flight)"
    )]
    ScopeSlotConflict {
        first: usize,
        second: usize,
        window: usize,
    },

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("operator '{op_type}' at position {position} failed: {source}")]
    OperatorFailed {
        op_type: String,
        position: usize,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("execution failure: {0}")]
    Execution(String),

    #[error(transparent)]
    Kernel(#[from] anyhow::Error),
}

impl RuntimeError {
    /// An implementation declining a record; the factory tries the next candidate.
    pub fn unsupported(op_type: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::UnsupportedFeature {
            op_type: op_type.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Failure inside tensor code, such as a bad shape or dtype.
    pub fn tensor(message: impl Into<String>) -> Self {
        RuntimeError::Tensor(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        RuntimeError::Execution(message.into())
    }

    /// Reports whether this failure only means "this implementation declined".
    pub fn is_unsupported_feature(&self) -> bool {
        matches!(self, RuntimeError::UnsupportedFeature { .. })
    }

    /// Error raised while constructing a registered graph type.
    pub fn graph_construction_cause(&self) -> Option<&RuntimeError> {
        match self {
            RuntimeError::UnknownGraphType {
                source: Some(source),
                ..
            } => Some(source),
            _ => None,
        }
    }

    /// Graph position of the failing operator, when the error carries one.
    pub fn failed_position(&self) -> Option<usize> {
        match self {
            RuntimeError::OperatorFailed { position, .. } => Some(*position),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
