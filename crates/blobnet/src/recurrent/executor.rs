//! Dependency-scheduled execution of a step graph across timesteps.
//!
//! Each timestep contributes a `Begin` task (sets the timestep blob), one task
//! per operator, and a `Finish` task. Edges come from read/write conflicts
//! inside a timestep, from the same operator in the previous timestep, and
//! from the link-derived recurrent mapping. `Begin(t)` waits on
//! `Finish(t - max_parallel_timesteps)`, bounding the timesteps in flight.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel;
use tracing::{debug, trace};

use crate::config::ExecutorConfig;
use crate::error::{Result, RuntimeError};
use crate::operator::{Operator, RunObserver};
use crate::record::{GraphRecord, OperatorRecord};
use crate::scope::Scope;

use super::state::update_timestep_blob;

struct OpTemplate {
    record: Arc<OperatorRecord>,
    reads: HashSet<String>,
    writes: HashSet<String>,
}

impl OpTemplate {
    fn new(record: Arc<OperatorRecord>) -> Self {
        let reads = record
            .inputs
            .iter()
            .chain(record.control_inputs.iter())
            .cloned()
            .collect();
        let writes = record.outputs.iter().cloned().collect();
        OpTemplate {
            record,
            reads,
            writes,
        }
    }

    fn conflicts_with(&self, later: &OpTemplate) -> bool {
        !self.writes.is_disjoint(&later.reads)
            || !self.writes.is_disjoint(&later.writes)
            || !self.reads.is_disjoint(&later.writes)
    }
}

struct TimestepOps {
    scope: Arc<Scope>,
    ops: Vec<Mutex<Box<dyn Operator>>>,
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Begin(usize),
    Op(usize, usize),
    Finish(usize),
}

/// Runs per-timestep operator instances with bounded cross-timestep overlap.
pub struct RecurrentExecutor {
    step: Arc<GraphRecord>,
    templates: Vec<OpTemplate>,
    intra_deps: Vec<Vec<usize>>,
    recurrent_deps: Vec<Vec<usize>>,
    timestep_blob: String,
    timesteps: Vec<Option<TimestepOps>>,
    num_threads: usize,
    max_parallel_timesteps: usize,
}

impl RecurrentExecutor {
    pub fn new(
        step: Arc<GraphRecord>,
        recurrent_mapping: &BTreeMap<String, String>,
        timestep_blob: impl Into<String>,
        config: &ExecutorConfig,
    ) -> Self {
        let templates: Vec<OpTemplate> = step
            .ops
            .iter()
            .map(|op| {
                let mut op = op.clone();
                if op.device.is_none() {
                    op.device = step.device;
                }
                OpTemplate::new(Arc::new(op))
            })
            .collect();

        let intra_deps = (0..templates.len())
            .map(|j| {
                (0..j)
                    .filter(|&i| templates[i].conflicts_with(&templates[j]))
                    .collect()
            })
            .collect();

        // Operator j at t reads, under a mapped name, what operator p wrote at t - 1.
        let recurrent_deps = templates
            .iter()
            .map(|consumer| {
                templates
                    .iter()
                    .enumerate()
                    .filter(|(_, producer)| {
                        producer.writes.iter().any(|written| {
                            recurrent_mapping
                                .get(written)
                                .is_some_and(|read| consumer.reads.contains(read))
                        })
                    })
                    .map(|(p, _)| p)
                    .collect()
            })
            .collect();

        RecurrentExecutor {
            step,
            templates,
            intra_deps,
            recurrent_deps,
            timestep_blob: timestep_blob.into(),
            timesteps: Vec::new(),
            num_threads: config.resolved_threads().max(1),
            max_parallel_timesteps: config.max_parallel_timesteps.max(1),
        }
    }

    pub fn step(&self) -> &Arc<GraphRecord> {
        &self.step
    }

    pub fn max_parallel_timesteps(&self) -> usize {
        self.max_parallel_timesteps
    }

    pub fn set_max_parallel_timesteps(&mut self, max: usize) {
        self.max_parallel_timesteps = max.max(1);
    }

    /// Makes sure timestep `t` has operators bound to `scope`, rebuilding
    /// them when the timestep moved to a different scope.
    pub fn ensure_timestep_initialized(
        &mut self,
        t: usize,
        scope: &Arc<Scope>,
        observers: &[Arc<dyn RunObserver>],
    ) -> Result<()> {
        if self.timesteps.len() <= t {
            self.timesteps.resize_with(t + 1, || None);
        }
        if let Some(existing) = &self.timesteps[t] {
            if Arc::ptr_eq(&existing.scope, scope) {
                return Ok(());
            }
        }

        update_timestep_blob(scope, &self.timestep_blob, t)?;
        let factory = scope.runtime().factory();
        let mut ops = Vec::with_capacity(self.templates.len());
        for (position, template) in self.templates.iter().enumerate() {
            let mut op = factory.create_operator(Arc::clone(&template.record), scope, Some(position))?;
            for observer in observers {
                op.base_mut().attach_observer(Arc::clone(observer));
            }
            ops.push(Mutex::new(op));
        }
        trace!(timestep = t, ops = ops.len(), "initialized timestep operators");
        self.timesteps[t] = Some(TimestepOps {
            scope: Arc::clone(scope),
            ops,
        });
        Ok(())
    }

    /// Fails if two timesteps that may be in flight together share a scope.
    pub fn check_scope_slots(&self, seq_len: usize) -> Result<()> {
        let window = self.max_parallel_timesteps;
        for t in 0..seq_len {
            let first = self.timestep(t)?;
            for u in t + 1..seq_len.min(t + window) {
                if Arc::ptr_eq(&first.scope, &self.timestep(u)?.scope) {
                    return Err(RuntimeError::ScopeSlotConflict {
                        first: t,
                        second: u,
                        window,
                    });
                }
            }
        }
        Ok(())
    }

    fn timestep(&self, t: usize) -> Result<&TimestepOps> {
        self.timesteps
            .get(t)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::execution(format!("timestep {t} was not initialized")))
    }

    fn task_count(&self) -> usize {
        self.templates.len() + 2
    }

    fn task_id(&self, task: Task) -> usize {
        let stride = self.task_count();
        match task {
            Task::Begin(t) => t * stride,
            Task::Op(t, j) => t * stride + 1 + j,
            Task::Finish(t) => t * stride + stride - 1,
        }
    }

    fn task_of(&self, id: usize) -> Task {
        let stride = self.task_count();
        let (t, slot) = (id / stride, id % stride);
        if slot == 0 {
            Task::Begin(t)
        } else if slot == stride - 1 {
            Task::Finish(t)
        } else {
            Task::Op(t, slot - 1)
        }
    }

    fn dependencies(&self, task: Task) -> Vec<Task> {
        match task {
            Task::Begin(t) => {
                if t >= self.max_parallel_timesteps {
                    vec![Task::Finish(t - self.max_parallel_timesteps)]
                } else {
                    Vec::new()
                }
            }
            Task::Op(t, j) => {
                let mut deps = vec![Task::Begin(t)];
                deps.extend(self.intra_deps[j].iter().map(|&i| Task::Op(t, i)));
                if t > 0 {
                    deps.push(Task::Op(t - 1, j));
                    deps.extend(self.recurrent_deps[j].iter().map(|&p| Task::Op(t - 1, p)));
                }
                deps
            }
            Task::Finish(t) => {
                let mut deps = vec![Task::Begin(t)];
                deps.extend((0..self.templates.len()).map(|j| Task::Op(t, j)));
                if t > 0 {
                    deps.push(Task::Finish(t - 1));
                }
                deps
            }
        }
    }

    fn execute(&self, task: Task) -> Result<()> {
        match task {
            Task::Begin(t) => {
                trace!(timestep = t, "begin timestep");
                update_timestep_blob(&self.timestep(t)?.scope, &self.timestep_blob, t)
            }
            Task::Op(t, j) => {
                let step = self.timestep(t)?;
                let mut op = step.ops[j].lock().expect("step operator poisoned");
                let op_type = op.base().op_type().to_string();
                for observer in op.base().observers() {
                    observer.on_start(&op_type);
                }
                let result = op.run();
                for observer in op.base().observers() {
                    observer.on_stop(&op_type, result.is_ok());
                }
                result.map_err(|source| RuntimeError::OperatorFailed {
                    op_type,
                    position: j,
                    source: Box::new(source),
                })
            }
            Task::Finish(t) => {
                trace!(timestep = t, "finish timestep");
                Ok(())
            }
        }
    }

    /// Runs timesteps `0..seq_len`; every one must have been initialized.
    pub fn run(&mut self, seq_len: usize) -> Result<()> {
        if seq_len == 0 {
            return Ok(());
        }
        self.check_scope_slots(seq_len)?;

        let total = seq_len * self.task_count();
        let mut pending: Vec<AtomicUsize> = Vec::with_capacity(total);
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        for id in 0..total {
            let deps = self.dependencies(self.task_of(id));
            pending.push(AtomicUsize::new(deps.len()));
            for dep in deps {
                dependents[self.task_id(dep)].push(id);
            }
        }

        let workers = self.num_threads.min(total);
        debug!(
            seq_len,
            workers,
            max_parallel_timesteps = self.max_parallel_timesteps,
            "running recurrent executor"
        );

        let (sender, receiver) = channel::unbounded::<Option<usize>>();
        for (id, count) in pending.iter().enumerate() {
            if count.load(Ordering::Relaxed) == 0 {
                sender
                    .send(Some(id))
                    .map_err(|_| RuntimeError::execution("executor queue closed"))?;
            }
        }

        let remaining = AtomicUsize::new(total);
        let aborted = AtomicBool::new(false);
        let first_error: Mutex<Option<RuntimeError>> = Mutex::new(None);
        let this = &*self;

        thread::scope(|s| {
            for _ in 0..workers {
                let sender = sender.clone();
                let receiver = receiver.clone();
                let (pending, dependents) = (&pending, &dependents);
                let (remaining, aborted, first_error) = (&remaining, &aborted, &first_error);
                s.spawn(move || {
                    let shutdown = || {
                        for _ in 0..workers {
                            let _ = sender.send(None);
                        }
                    };
                    while let Ok(Some(id)) = receiver.recv() {
                        if aborted.load(Ordering::Acquire) {
                            continue;
                        }
                        if let Err(err) = this.execute(this.task_of(id)) {
                            let mut slot = first_error.lock().expect("executor error slot poisoned");
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            aborted.store(true, Ordering::Release);
                            shutdown();
                            continue;
                        }
                        for &next in &dependents[id] {
                            if pending[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                                let _ = sender.send(Some(next));
                            }
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            shutdown();
                        }
                    }
                });
            }
        });

        match first_error.into_inner().expect("executor error slot poisoned") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
