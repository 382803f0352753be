//! Live operator instances and the binding of record names to blobs.

use std::fmt;
use std::sync::Arc;

use crate::blob::BlobRef;
use crate::error::{Result, RuntimeError};
use crate::record::{DeviceOption, FromArg, OperatorRecord};
use crate::scope::Scope;
use crate::tensor::Tensor;

/// Hook notified around operator and graph runs.
pub trait RunObserver: Send + Sync {
    fn on_start(&self, _subject: &str) {}
    fn on_stop(&self, _subject: &str, _succeeded: bool) {}
}

/// Everything a builder needs to construct an operator.
pub struct OperatorContext<'a> {
    pub record: Arc<OperatorRecord>,
    pub scope: &'a Arc<Scope>,
}

/// Registered constructor for one operator key.
pub type OperatorBuilder =
    Arc<dyn Fn(OperatorContext<'_>) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Wraps a plain function or closure as an [`OperatorBuilder`].
pub fn builder<F>(f: F) -> OperatorBuilder
where
    F: Fn(OperatorContext<'_>) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A runnable operator bound to its blobs.
pub trait Operator: Send {
    fn base(&self) -> &OperatorBase;
    fn base_mut(&mut self) -> &mut OperatorBase;

    /// Runs to completion.
    fn run(&mut self) -> Result<()>;

    /// Starts a run. CPU operators complete synchronously.
    fn run_async(&mut self) -> Result<()> {
        self.run()
    }

    fn observer_count(&self) -> usize {
        self.base().observer_count()
    }
}

impl fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("type", &self.base().op_type())
            .field("engine", &self.base().engine())
            .finish()
    }
}

/// State shared by every operator: its record, bound blobs and dispatch info.
///
/// Inputs must exist when the operator is constructed; outputs are created in
/// the scope if absent. Blob handles stay valid for the operator's lifetime.
pub struct OperatorBase {
    record: Arc<OperatorRecord>,
    inputs: Vec<BlobRef>,
    outputs: Vec<BlobRef>,
    engine: String,
    net_position: Option<usize>,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl OperatorBase {
    pub fn new(ctx: &OperatorContext<'_>) -> Result<Self> {
        let record = Arc::clone(&ctx.record);
        let inputs = record
            .inputs
            .iter()
            .map(|name| {
                ctx.scope.get_blob(name).ok_or_else(|| RuntimeError::MissingInput {
                    op_type: record.op_type.clone(),
                    blob: name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = record
            .outputs
            .iter()
            .map(|name| ctx.scope.create_blob(name))
            .collect();
        Ok(OperatorBase {
            record,
            inputs,
            outputs,
            engine: String::new(),
            net_position: None,
            observers: Vec::new(),
        })
    }

    pub fn record(&self) -> &Arc<OperatorRecord> {
        &self.record
    }

    pub fn op_type(&self) -> &str {
        &self.record.op_type
    }

    pub fn device(&self) -> DeviceOption {
        self.record.device.unwrap_or_default()
    }

    /// Engine the factory matched; empty for the default implementation.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub(crate) fn set_engine(&mut self, engine: String) {
        self.engine = engine;
    }

    pub fn net_position(&self) -> Option<usize> {
        self.net_position
    }

    pub(crate) fn set_net_position(&mut self, position: Option<usize>) {
        self.net_position = position;
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn inputs(&self) -> &[BlobRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[BlobRef] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> &BlobRef {
        &self.inputs[index]
    }

    pub fn output(&self, index: usize) -> &BlobRef {
        &self.outputs[index]
    }

    pub fn input_name(&self, index: usize) -> &str {
        &self.record.inputs[index]
    }

    pub fn output_name(&self, index: usize) -> &str {
        &self.record.outputs[index]
    }

    /// Tensor held by input `index`; anything else is a type error.
    pub fn input_tensor(&self, index: usize) -> Result<Tensor> {
        self.inputs[index].require_tensor(self.input_name(index))
    }

    pub fn single_arg<T: FromArg>(&self, name: &str) -> Result<Option<T>> {
        self.record.single(name)
    }

    pub fn single_arg_or<T: FromArg>(&self, name: &str, default: T) -> Result<T> {
        self.record.single_or(name, default)
    }

    pub fn repeated_arg<T: FromArg>(&self, name: &str) -> Result<Vec<T>> {
        self.record.repeated(name)
    }

    pub fn attach_observer(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn observers(&self) -> &[Arc<dyn RunObserver>] {
        &self.observers
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl fmt::Debug for OperatorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorBase")
            .field("type", &self.record.op_type)
            .field("inputs", &self.record.inputs)
            .field("outputs", &self.record.outputs)
            .field("engine", &self.engine)
            .field("net_position", &self.net_position)
            .finish()
    }
}
