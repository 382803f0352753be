//! Graph runtimes: construct operators from a [`GraphRecord`] and run them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::error::{Result, RuntimeError};
use crate::operator::{Operator, RunObserver};
use crate::record::GraphRecord;
use crate::scope::Scope;

/// A constructed graph bound to a scope.
pub trait Graph: Send {
    fn name(&self) -> &str;

    fn record(&self) -> &Arc<GraphRecord>;

    /// Runs every operator and waits for completion.
    fn run(&mut self) -> Result<()>;

    /// Starts a run; sequential runtimes complete before returning.
    fn run_async(&mut self) -> Result<()> {
        self.run()
    }

    fn attach_observer(&mut self, observer: Arc<dyn RunObserver>);

    fn observer_count(&self) -> usize;
}

impl fmt::Debug for dyn Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph").field("name", &self.name()).finish()
    }
}

/// Constructor registered under a graph type string.
pub type GraphBuilder =
    Arc<dyn Fn(Arc<GraphRecord>, &Arc<Scope>) -> Result<Box<dyn Graph>> + Send + Sync>;

/// Graph constructors keyed by the record's `type` string.
#[derive(Default, Clone)]
pub struct GraphRegistry {
    builders: HashMap<String, GraphBuilder>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the sequential runtime under `simple` and `async_simple`.
    pub fn with_defaults() -> Self {
        let mut registry = GraphRegistry::new();
        let simple: GraphBuilder = Arc::new(|record, scope| {
            SimpleGraph::new(record, scope).map(|graph| Box::new(graph) as Box<dyn Graph>)
        });
        registry.register(SimpleGraph::TYPE, Arc::clone(&simple));
        registry.register(SimpleGraph::ASYNC_TYPE, simple);
        registry
    }

    pub fn register(&mut self, graph_type: impl Into<String>, builder: GraphBuilder) {
        self.builders.insert(graph_type.into(), builder);
    }

    pub fn contains(&self, graph_type: &str) -> bool {
        self.builders.contains_key(graph_type)
    }

    /// Constructs a graph of the record's type.
    ///
    /// Both an unregistered type and a failing constructor are reported as
    /// [`RuntimeError::UnknownGraphType`]; the constructor's error is its source.
    pub fn create(&self, record: Arc<GraphRecord>, scope: &Arc<Scope>) -> Result<Box<dyn Graph>> {
        let graph_type = record.graph_type.clone();
        let Some(builder) = self.builders.get(&graph_type) else {
            return Err(RuntimeError::UnknownGraphType {
                graph_type,
                source: None,
            });
        };
        builder(record, scope).map_err(|err| RuntimeError::UnknownGraphType {
            graph_type,
            source: Some(Box::new(err)),
        })
    }
}

/// Checks declared external inputs/outputs of `record` against `scope`.
fn validate_externals(record: &GraphRecord, scope: &Scope) -> Result<()> {
    let produced: HashSet<&str> = record
        .ops
        .iter()
        .flat_map(|op| op.outputs.iter().map(String::as_str))
        .collect();
    for input in &record.external_inputs {
        if !scope.has_blob(input) && !produced.contains(input.as_str()) {
            return Err(RuntimeError::UnknownExternalInput {
                graph: record.name.clone(),
                blob: input.clone(),
            });
        }
    }

    let mut known: HashSet<&str> = record.external_inputs.iter().map(String::as_str).collect();
    let mut remaining: BTreeSet<&str> = record
        .external_outputs
        .iter()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();
    for op in &record.ops {
        for input in &op.inputs {
            if known.contains(input.as_str()) {
                continue;
            }
            if record.external_inputs.is_empty() {
                trace!(graph = %record.name, op_type = %op.op_type, blob = %input, "input source not declared");
            } else {
                return Err(RuntimeError::UnknownInputSource {
                    graph: record.name.clone(),
                    op_type: op.op_type.clone(),
                    blob: input.clone(),
                });
            }
        }
        for output in &op.outputs {
            known.insert(output.as_str());
            remaining.remove(output.as_str());
        }
    }
    if !remaining.is_empty() {
        return Err(RuntimeError::UnproducedExternalOutput {
            graph: record.name.clone(),
            blobs: remaining.into_iter().map(str::to_string).collect(),
        });
    }
    Ok(())
}

/// Sequential runtime: operators run in record order on the calling thread.
pub struct SimpleGraph {
    record: Arc<GraphRecord>,
    operators: Vec<Box<dyn Operator>>,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl SimpleGraph {
    pub const TYPE: &'static str = "simple";
    pub const ASYNC_TYPE: &'static str = "async_simple";

    pub fn new(record: Arc<GraphRecord>, scope: &Arc<Scope>) -> Result<Self> {
        debug!(graph = %record.name, ops = record.ops.len(), "constructing graph");
        validate_externals(&record, scope)?;

        let factory = scope.runtime().factory();
        let mut operators = Vec::with_capacity(record.ops.len());
        for (position, op) in record.ops.iter().enumerate() {
            trace!(graph = %record.name, position, op_type = %op.op_type, "creating operator");
            let op_record = match (op.device, record.device) {
                (None, Some(device)) => {
                    let mut inherited = op.clone();
                    inherited.device = Some(device);
                    Arc::new(inherited)
                }
                _ => Arc::new(op.clone()),
            };
            operators.push(factory.create_operator(op_record, scope, Some(position))?);
        }

        Ok(SimpleGraph {
            record,
            operators,
            observers: Vec::new(),
        })
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }
}

impl Graph for SimpleGraph {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn record(&self) -> &Arc<GraphRecord> {
        &self.record
    }

    fn run(&mut self) -> Result<()> {
        for observer in &self.observers {
            observer.on_start(&self.record.name);
        }
        trace!(graph = %self.record.name, "running graph");
        let mut outcome = Ok(());
        for (position, op) in self.operators.iter_mut().enumerate() {
            let op_type = op.base().op_type().to_string();
            for observer in op.base().observers() {
                observer.on_start(&op_type);
            }
            let result = op.run();
            for observer in op.base().observers() {
                observer.on_stop(&op_type, result.is_ok());
            }
            if let Err(source) = result {
                error!(
                    graph = %self.record.name,
                    position,
                    record = %op.base().record().debug_string(),
                    "operator failed"
                );
                outcome = Err(RuntimeError::OperatorFailed {
                    op_type,
                    position,
                    source: Box::new(source),
                });
                break;
            }
        }
        for observer in &self.observers {
            observer.on_stop(&self.record.name, outcome.is_ok());
        }
        outcome
    }

    fn attach_observer(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    fn observer_count(&self) -> usize {
        self.observers.len()
    }
}
