//! The `RecurrentNetwork` operator: runs a step graph once per timestep.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};
use crate::graph::SimpleGraph;
use crate::operator::{Operator, OperatorBase, OperatorContext, RunObserver};
use crate::record::GraphRecord;
use crate::schema::OpSchema;
use crate::scope::Scope;

use super::executor::RecurrentExecutor;
use super::link::{
    add_apply_link_ops, extract_aliases, extract_links, extract_recurrent_inputs, recurrent_mapping,
    Link, OffsetAlias, RecurrentInput,
};
use super::state::{apply_offset_alias, initialize_recurrent_input, update_timestep_blob};

pub const RECURRENT_NETWORK_OP: &str = "RecurrentNetwork";

const DEFAULT_TIMESTEP_BLOB: &str = "timestep";

pub(crate) fn schema() -> OpSchema {
    OpSchema::new(RECURRENT_NETWORK_OP)
        .inputs_between(1, usize::MAX)
        .outputs_between(2, usize::MAX)
        .doc(
            "Runs a step graph once per timestep of input 0. Recurrent states are \
             initialized from the inputs, links expose per-timestep windows of external \
             buffers to the step graph, and aliases expose state windows afterwards. The \
             last output holds the step scopes.",
        )
}

/// Progress of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Constructed,
    /// A step scope is assigned to timestep `t`.
    Idle(usize),
    /// Timestep `t` has its timestep blob and step operators in place.
    Linked(usize),
    /// Timestep `t` finished.
    Ran(usize),
    Aliased,
    Done,
}

#[derive(Default)]
struct StepScopesInner {
    shared: Option<Arc<Scope>>,
    steps: Vec<Option<Arc<Scope>>>,
}

/// Scope shared by every timestep plus the per-timestep child scopes.
///
/// Stored in the operator's last output so a backward pass can reach the
/// activations of each timestep.
#[derive(Default)]
pub struct StepScopes {
    inner: Mutex<StepScopesInner>,
}

impl StepScopes {
    /// Shared scope, created as a child of `outer` on first use.
    pub fn shared_scope(&self, outer: &Arc<Scope>) -> Arc<Scope> {
        let mut inner = self.inner.lock().expect("step scopes poisoned");
        Arc::clone(inner.shared.get_or_insert_with(|| Scope::new_child(outer)))
    }

    pub fn shared(&self) -> Option<Arc<Scope>> {
        self.inner
            .lock()
            .expect("step scopes poisoned")
            .shared
            .clone()
    }

    /// Grows the pool to at least `len` slots. Never shrinks, since other
    /// operators may hold on to existing scopes.
    pub fn ensure_len(&self, len: usize) {
        let mut inner = self.inner.lock().expect("step scopes poisoned");
        if inner.steps.len() < len {
            inner.steps.resize_with(len, || None);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("step scopes poisoned").steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scope in `slot`, created as a child of `shared` if missing.
    pub fn step_scope(&self, slot: usize, shared: &Arc<Scope>) -> Arc<Scope> {
        let mut inner = self.inner.lock().expect("step scopes poisoned");
        if inner.steps.len() <= slot {
            inner.steps.resize_with(slot + 1, || None);
        }
        Arc::clone(inner.steps[slot].get_or_insert_with(|| Scope::new_child(shared)))
    }

    pub fn get(&self, slot: usize) -> Option<Arc<Scope>> {
        self.inner
            .lock()
            .expect("step scopes poisoned")
            .steps
            .get(slot)
            .cloned()
            .flatten()
    }
}

impl fmt::Debug for StepScopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepScopes").field("len", &self.len()).finish()
    }
}

pub struct RecurrentNetworkOp {
    base: OperatorBase,
    outer: Weak<Scope>,
    step: Arc<GraphRecord>,
    timestep: String,
    links: Vec<Link>,
    aliases: Vec<OffsetAlias>,
    recurrent_inputs: Vec<RecurrentInput>,
    recompute_blobs: Vec<String>,
    has_backward_pass: bool,
    executor: Option<RecurrentExecutor>,
    forward_only_pool: usize,
    executor_pool: usize,
    step_observers: Vec<Arc<dyn RunObserver>>,
    phase: RunPhase,
}

impl fmt::Debug for RecurrentNetworkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentNetworkOp")
            .field("type", &self.base.op_type())
            .field("timestep", &self.timestep)
            .finish()
    }
}

impl RecurrentNetworkOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        let base = OperatorBase::new(&ctx)?;
        let record = Arc::clone(base.record());
        let config = ctx.scope.runtime().config();

        let mut step = record
            .graph_arg("step_net")?
            .ok_or_else(|| RuntimeError::invalid_argument("step_net", "missing step graph"))?;
        let timestep = record.single_or("timestep", DEFAULT_TIMESTEP_BLOB.to_string())?;

        let recurrent_inputs = extract_recurrent_inputs(&record)?;
        for input in &recurrent_inputs {
            // Forward and backward passes must see the same state buffer.
            ctx.scope.create_blob(&input.state);
        }
        let links = extract_links(
            &record,
            "link_internal",
            "link_external",
            "link_offset",
            "link_window",
        )?;
        let aliases = extract_aliases(&record)?;
        let recompute_blobs = record.repeated("recompute_blobs_on_backward")?;

        let has_backward_pass = record.has_single_of_type::<GraphRecord>("backward_step_net")
            || record
                .single::<String>("backward_step_net")
                .ok()
                .flatten()
                .is_some_and(|text| !text.is_empty());

        if step.name.is_empty() {
            step.name = if record.name.is_empty() {
                format!("{RECURRENT_NETWORK_OP}_step")
            } else {
                format!("{}_step", record.name)
            };
        }
        step.external_inputs.push(timestep.clone());
        add_apply_link_ops(&links, &timestep, record.device, &mut step);

        let use_executor =
            config.rnn_executor && record.single_or("enable_rnn_executor", false)?;
        let executor = if use_executor {
            debug!(op = %record.name, "using recurrent executor");
            let mapping = recurrent_mapping(&links, false);
            Some(RecurrentExecutor::new(
                Arc::new(step.clone()),
                &mapping,
                timestep.clone(),
                &config.executor,
            ))
        } else {
            if step.graph_type == "rnn" {
                step.graph_type = SimpleGraph::ASYNC_TYPE.to_string();
            }
            if step.graph_type == "async_dag" {
                return Err(RuntimeError::invalid_argument(
                    "step_net",
                    "graph type 'async_dag' cannot be used as a step graph",
                ));
            }
            None
        };

        Ok(RecurrentNetworkOp {
            base,
            outer: Arc::downgrade(ctx.scope),
            step: Arc::new(step),
            timestep,
            links,
            aliases,
            recurrent_inputs,
            recompute_blobs,
            has_backward_pass,
            executor,
            forward_only_pool: config.forward_only_scope_pool,
            executor_pool: config.executor_scope_pool,
            step_observers: Vec::new(),
            phase: RunPhase::Constructed,
        })
    }

    /// Step graph after link operators were prepended.
    pub fn step_graph(&self) -> &Arc<GraphRecord> {
        &self.step
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn aliases(&self) -> &[OffsetAlias] {
        &self.aliases
    }

    pub fn has_backward_pass(&self) -> bool {
        self.has_backward_pass
    }

    pub fn uses_executor(&self) -> bool {
        self.executor.is_some()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Observer attached to every step graph (or step operator) this operator builds.
    pub fn attach_step_observer(&mut self, observer: Arc<dyn RunObserver>) {
        self.step_observers.push(observer);
    }

    fn set_phase(&mut self, phase: RunPhase) {
        trace!(op = %self.base.record().name, ?phase, "recurrent phase");
        self.phase = phase;
    }

    fn run_timesteps(&mut self, outer: &Arc<Scope>) -> Result<()> {
        let input = self.base.input_tensor(0)?;
        let (seq_len, batch) = match input.dims() {
            [seq_len, batch, ..] => (*seq_len, *batch),
            dims => {
                return Err(RuntimeError::TypeMismatch {
                    blob: self.base.input_name(0).to_string(),
                    reason: format!("expected at least [time, batch] dimensions, got {dims:?}"),
                })
            }
        };
        for input in &self.recurrent_inputs {
            initialize_recurrent_input(input, seq_len, batch, outer)?;
        }

        let last = self.base.num_outputs() - 1;
        let step_scopes = self.base.output(last).get_or_init_opaque(StepScopes::default);
        let shared = step_scopes.shared_scope(outer);
        for name in &self.recompute_blobs {
            shared.create_blob(name);
        }

        let pool = if self.executor.is_some() {
            self.executor_pool
        } else {
            self.forward_only_pool
        };
        if self.has_backward_pass {
            step_scopes.ensure_len(seq_len);
        } else {
            step_scopes.ensure_len(pool);
        }

        for t in 0..seq_len {
            self.set_phase(RunPhase::Idle(t));
            let slot = if self.has_backward_pass { t } else { t % pool };
            let scope = step_scopes.step_scope(slot, &shared);

            if let Some(executor) = self.executor.as_mut() {
                if !self.has_backward_pass {
                    // Rotating scopes bound how many timesteps may overlap.
                    let bound = executor.max_parallel_timesteps().min(pool);
                    executor.set_max_parallel_timesteps(bound);
                }
                executor.ensure_timestep_initialized(t, &scope, &self.step_observers)?;
                self.set_phase(RunPhase::Linked(t));
            } else {
                update_timestep_blob(&scope, &self.timestep, t)?;
                let graph = match scope.get_graph(&self.step.name) {
                    Some(graph) => graph,
                    None => {
                        let graph = scope.create_graph(Arc::clone(&self.step), false)?;
                        let mut guard = graph.lock().expect("graph poisoned");
                        for observer in &self.step_observers {
                            guard.attach_observer(Arc::clone(observer));
                        }
                        drop(guard);
                        graph
                    }
                };
                self.set_phase(RunPhase::Linked(t));
                graph.lock().expect("graph poisoned").run_async()?;
                self.set_phase(RunPhase::Ran(t));
            }
        }

        if let Some(executor) = self.executor.as_mut() {
            executor.run(seq_len)?;
            if seq_len > 0 {
                self.set_phase(RunPhase::Ran(seq_len - 1));
            }
        }

        for alias in &self.aliases {
            apply_offset_alias(alias, outer)?;
        }
        self.set_phase(RunPhase::Aliased);
        Ok(())
    }
}

impl Operator for RecurrentNetworkOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> Result<()> {
        let outer = self
            .outer
            .upgrade()
            .ok_or_else(|| RuntimeError::execution("owning scope of recurrent operator was dropped"))?;
        self.run_timesteps(&outer)?;
        self.set_phase(RunPhase::Done);
        Ok(())
    }

    fn observer_count(&self) -> usize {
        self.base.observer_count() + self.step_observers.len()
    }
}
