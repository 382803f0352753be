use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use blobnet::recurrent::link::recurrent_mapping;
use blobnet::recurrent::state::{apply_offset_alias, initialize_recurrent_input};
use blobnet::recurrent::{
    Link, OffsetAlias, RecurrentExecutor, RecurrentInput, RecurrentNetworkOp, RunPhase,
    StepScopes, APPLY_LINK_OP,
};
use blobnet::{
    builder, ExecutorConfig, GraphRecord, Operator, OperatorBase, OperatorContext,
    OperatorRecord, RunObserver, Runtime, RuntimeConfig, RuntimeError, Scope, Tensor,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Element-wise `out = lhs + rhs` over f32 tensors of equal size.
struct Plus {
    base: OperatorBase,
}

impl Operator for Plus {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> blobnet::Result<()> {
        let lhs = self.base.input_tensor(0)?;
        let rhs = self.base.input_tensor(1)?.to_vec::<f32>()?;
        let sum: Vec<f32> = lhs
            .to_vec::<f32>()?
            .iter()
            .zip(&rhs)
            .map(|(a, b)| a + b)
            .collect();
        let out = self
            .base
            .output(0)
            .resize_tensor(lhs.shape().clone(), blobnet::DType::F32);
        out.copy_from_slice(&sum)
    }
}

const BATCH: usize = 2;
const WIDTH: usize = 2;

fn scope_with(config: RuntimeConfig) -> Result<Arc<Scope>> {
    let mut runtime = Runtime::builder().with_config(config);
    runtime.register_operator(
        blobnet::DeviceType::CPU,
        "Plus",
        builder(|ctx: OperatorContext<'_>| {
            Ok(Box::new(Plus {
                base: OperatorBase::new(&ctx)?,
            }) as Box<dyn Operator>)
        }),
    )?;
    Ok(runtime.build()?.root_scope())
}

fn feed(scope: &Scope, name: &str, dims: &[usize], values: Vec<f32>) -> Result<()> {
    scope
        .create_blob(name)
        .set_tensor(Tensor::from_vec(dims.to_vec(), values)?);
    Ok(())
}

fn tensor(scope: &Scope, name: &str) -> Result<Tensor> {
    let blob = scope
        .get_blob(name)
        .ok_or_else(|| anyhow::anyhow!("blob '{name}' missing"))?;
    Ok(blob.require_tensor(name)?)
}

/// Running sum: `h_t = x_t + h_{t-1}`.
fn accumulate(name: &str) -> OperatorRecord {
    OperatorRecord::new("RecurrentNetwork")
        .named(name)
        .input("X")
        .input("h0")
        .output("H_all")
        .output("step_scopes")
        .arg(
            "step_net",
            GraphRecord::new("").op(OperatorRecord::new("Plus")
                .input("x_t")
                .input("h_prev")
                .output("h")),
        )
        .arg("recurrent_states", vec!["H"])
        .arg("initial_recurrent_state_ids", vec![1i64])
        .arg("link_internal", vec!["h_prev", "h", "x_t"])
        .arg("link_external", vec!["H", "H", "X"])
        .arg("link_offset", vec![-1i64, 0, 0])
        .arg("alias_src", vec!["H"])
        .arg("alias_dst", vec!["H_all"])
        .arg("alias_offset", vec![1i64])
}

fn feed_sequence(scope: &Scope, steps: usize) -> Result<Vec<f32>> {
    let row = BATCH * WIDTH;
    let xs: Vec<f32> = (0..steps * row).map(|i| (i % 5) as f32).collect();
    feed(scope, "X", &[steps, BATCH, WIDTH], xs.clone())?;
    feed(scope, "h0", &[BATCH, WIDTH], vec![100.0; row])?;
    Ok(xs)
}

fn running_sum(xs: &[f32], steps: usize) -> Vec<f32> {
    let row = BATCH * WIDTH;
    let mut acc = vec![100.0f32; row];
    let mut out = Vec::with_capacity(steps * row);
    for t in 0..steps {
        for i in 0..row {
            acc[i] += xs[t * row + i];
        }
        out.extend_from_slice(&acc);
    }
    out
}

#[test]
fn link_at_first_timestep_views_the_initial_state() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "h0", &[BATCH, WIDTH], vec![1.0, 2.0, 3.0, 4.0])?;
    scope.create_blob("H");
    let input = RecurrentInput {
        state: "H".into(),
        input: "h0".into(),
    };
    initialize_recurrent_input(&input, 5, BATCH, &scope)?;
    let state = tensor(&scope, "H")?;
    assert_eq!(state.dims(), &[6, BATCH, WIDTH]);
    assert_eq!(state.time_origin(), 1);

    scope
        .create_blob("timestep")
        .set_tensor(Tensor::from_vec([1], vec![0i32])?);
    scope.run_operator_once(
        OperatorRecord::new(APPLY_LINK_OP)
            .input("timestep")
            .input("H")
            .output("h_prev")
            .output("H")
            .arg("offset", -1i64)
            .arg("window", 1i64),
    )?;
    let view = tensor(&scope, "h_prev")?;
    assert!(view.shares_storage(&state));
    assert_eq!(view.dims(), &[1, BATCH, WIDTH]);
    assert_eq!(view.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);

    // Writes through the view land in the buffer and the other way round.
    view.fill(9.0f32)?;
    assert_eq!(state.read_elements::<f32>(0, 4)?, vec![9.0; 4]);
    state.write_elements(0, &[5.0f32])?;
    assert_eq!(view.read_elements::<f32>(0, 1)?, vec![5.0]);
    Ok(())
}

#[test]
fn every_timestep_keeps_a_view_of_its_state_row() -> Result<()> {
    let steps = 5;
    let row = BATCH * WIDTH;
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "X", &[steps, BATCH, WIDTH], vec![0.0; steps * row])?;
    feed(&scope, "h0", &[BATCH, WIDTH], vec![1.0, 2.0, 3.0, 4.0])?;
    scope.run_operator_once(
        OperatorRecord::new("RecurrentNetwork")
            .named("lookback")
            .input("X")
            .input("h0")
            .output("H_all")
            .output("step_scopes")
            .arg(
                "step_net",
                GraphRecord::new("").op(OperatorRecord::new("Plus")
                    .input("h")
                    .input("h")
                    .output("doubled")),
            )
            .arg("recurrent_states", vec!["H"])
            .arg("initial_recurrent_state_ids", vec![1i64])
            .arg("link_internal", vec!["h"])
            .arg("link_external", vec!["H"])
            .arg("link_offset", vec![-1i64])
            .arg("link_window", vec![1i64])
            .arg("alias_src", vec!["H"])
            .arg("alias_dst", vec!["H_all"])
            .arg("alias_offset", vec![1i64])
            .arg("backward_step_net", "lookback_backward"),
    )?;

    let state = tensor(&scope, "H")?;
    let origin = state.time_origin();
    assert_eq!(origin, 1);
    let pool = scope
        .get_blob("step_scopes")
        .and_then(|blob| blob.opaque::<StepScopes>())
        .expect("step scopes");
    assert_eq!(pool.len(), steps);

    // The first timestep read the initial state through its view.
    let first = pool.get(0).expect("first step scope");
    assert_eq!(tensor(&first, "doubled")?.to_vec::<f32>()?, vec![2.0, 4.0, 6.0, 8.0]);

    let marked: Vec<f32> = (0..(steps + 1) * row).map(|i| i as f32).collect();
    state.write_elements(0, &marked)?;
    for t in 0..steps {
        let step_scope = pool.get(t).expect("scope per timestep");
        let view = tensor(&step_scope, "h")?;
        assert!(view.shares_storage(&state), "timestep {t}");
        assert_eq!(view.dims(), &[1, BATCH, WIDTH]);
        let start = (origin + t - 1) * row;
        assert_eq!(view.to_vec::<f32>()?, marked[start..start + row].to_vec(), "timestep {t}");
    }
    Ok(())
}

#[test]
fn link_outside_the_buffer_is_an_error() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "X", &[3, BATCH, WIDTH], vec![0.0; 3 * BATCH * WIDTH])?;
    scope
        .create_blob("timestep")
        .set_tensor(Tensor::from_vec([1], vec![2i32])?);
    let err = scope
        .run_operator_once(
            OperatorRecord::new(APPLY_LINK_OP)
                .input("timestep")
                .input("X")
                .output("x_next")
                .output("X")
                .arg("offset", 1i64)
                .arg("window", 1i64),
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Tensor(_)), "{err}");
    Ok(())
}

#[test]
fn aliases_share_storage_with_their_source() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "src", &[5, 2], (0..10).map(|v| v as f32).collect())?;

    let tail = apply_offset_alias(
        &OffsetAlias {
            src: "src".into(),
            dst: "tail".into(),
            offset: 1,
        },
        &scope,
    )?;
    assert_eq!(tail.dims(), &[4, 2]);
    assert_eq!(tail.read_elements::<f32>(0, 2)?, vec![2.0, 3.0]);
    tail.write_elements(0, &[-1.0f32])?;
    assert_eq!(tensor(&scope, "src")?.read_elements::<f32>(2, 1)?, vec![-1.0]);
    tensor(&scope, "src")?.write_elements(9, &[42.0f32])?;
    assert_eq!(tensor(&scope, "tail")?.read_elements::<f32>(7, 1)?, vec![42.0]);

    let last = apply_offset_alias(
        &OffsetAlias {
            src: "src".into(),
            dst: "last_two".into(),
            offset: -2,
        },
        &scope,
    )?;
    assert_eq!(last.dims(), &[2, 2]);
    assert_eq!(last.read_elements::<f32>(3, 1)?, vec![42.0]);

    let err = apply_offset_alias(
        &OffsetAlias {
            src: "src".into(),
            dst: "nothing".into(),
            offset: 5,
        },
        &scope,
    )
    .unwrap_err();
    assert!(err.to_string().contains("invalid number of timesteps"), "{err}");
    Ok(())
}

#[test]
fn sequential_and_scheduled_runs_agree() -> Result<()> {
    init_tracing();
    let steps = 8;
    let sequential = scope_with(RuntimeConfig::default())?;
    let xs = feed_sequence(&sequential, steps)?;
    sequential.run_operator_once(accumulate("rnn"))?;

    let scheduled = scope_with(RuntimeConfig {
        executor: ExecutorConfig {
            num_threads: 3,
            max_parallel_timesteps: 2,
        },
        ..RuntimeConfig::default()
    })?;
    feed_sequence(&scheduled, steps)?;
    scheduled.run_operator_once(accumulate("rnn").arg("enable_rnn_executor", true))?;

    let expected = running_sum(&xs, steps);
    assert_eq!(tensor(&sequential, "H_all")?.to_vec::<f32>()?, expected);
    assert_eq!(tensor(&scheduled, "H_all")?.to_vec::<f32>()?, expected);
    Ok(())
}

#[derive(Default)]
struct CountRuns(AtomicUsize);

impl RunObserver for CountRuns {
    fn on_start(&self, _subject: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn run_walks_the_phases_and_rewrites_the_step_graph() -> Result<()> {
    let steps = 5;
    let scope = scope_with(RuntimeConfig::default())?;
    let xs = feed_sequence(&scope, steps)?;
    let mut op = RecurrentNetworkOp::new(OperatorContext {
        record: Arc::new(accumulate("rnn")),
        scope: &scope,
    })?;
    assert_eq!(op.phase(), RunPhase::Constructed);
    assert!(!op.uses_executor());
    assert!(!op.has_backward_pass());
    assert_eq!(op.links().len(), 3);
    assert_eq!(op.aliases().len(), 1);

    let step = op.step_graph();
    assert_eq!(step.name, "rnn_step");
    assert_eq!(step.ops.len(), 4);
    assert!(step.ops[..3].iter().all(|o| o.op_type == APPLY_LINK_OP));
    assert!(step.external_inputs.iter().any(|name| name == "timestep"));
    // The body writes `h` before reading it, so it is ordered after the link.
    assert_eq!(step.ops[3].control_inputs, vec!["h".to_string()]);

    let runs = Arc::new(CountRuns::default());
    op.attach_step_observer(runs.clone());
    assert_eq!(op.observer_count(), 1);
    op.run()?;
    assert_eq!(op.phase(), RunPhase::Done);
    assert_eq!(runs.0.load(Ordering::SeqCst), steps);
    assert_eq!(tensor(&scope, "H_all")?.to_vec::<f32>()?, running_sum(&xs, steps));
    Ok(())
}

#[test]
fn legacy_step_graph_types_are_mapped() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed_sequence(&scope, 2)?;
    let mut record = accumulate("rnn");
    let step = GraphRecord::new("body")
        .with_type("rnn")
        .op(OperatorRecord::new("Plus").input("x_t").input("h_prev").output("h"));
    record.set_arg("step_net", step.clone());
    let op = RecurrentNetworkOp::new(OperatorContext {
        record: Arc::new(record.clone()),
        scope: &scope,
    })?;
    assert_eq!(op.step_graph().graph_type, "async_simple");

    record.set_arg("step_net", step.with_type("async_dag"));
    let err = RecurrentNetworkOp::new(OperatorContext {
        record: Arc::new(record),
        scope: &scope,
    })
    .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { .. }), "{err}");
    Ok(())
}

#[test]
fn step_net_may_be_given_as_json_text() -> Result<()> {
    let steps = 3;
    let scope = scope_with(RuntimeConfig::default())?;
    let xs = feed_sequence(&scope, steps)?;
    let text = GraphRecord::new("")
        .op(OperatorRecord::new("Plus").input("x_t").input("h_prev").output("h"))
        .to_json_string()?;
    let mut record = accumulate("rnn");
    record.set_arg("step_net", text);
    scope.run_operator_once(record)?;
    assert_eq!(tensor(&scope, "H_all")?.to_vec::<f32>()?, running_sum(&xs, steps));
    Ok(())
}

#[test]
fn mismatched_link_lists_are_rejected() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed_sequence(&scope, 2)?;
    let record = accumulate("rnn").arg("link_offset", vec![0i64]);
    let err = scope.run_operator_once(record).unwrap_err();
    assert!(matches!(err, RuntimeError::ArgumentMismatch(_)), "{err}");
    Ok(())
}

#[test]
fn shared_scope_slots_inside_the_window_are_rejected() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "a", &[1], vec![1.0])?;
    let step = GraphRecord::new("step").op(OperatorRecord::new("Plus").input("a").input("a").output("b"));
    let config = ExecutorConfig {
        num_threads: 2,
        max_parallel_timesteps: 2,
    };
    let mut executor = RecurrentExecutor::new(Arc::new(step), &BTreeMap::new(), "timestep", &config);
    let slot = Scope::new_child(&scope);
    executor.ensure_timestep_initialized(0, &slot, &[])?;
    executor.ensure_timestep_initialized(1, &slot, &[])?;
    let err = executor.run(2).unwrap_err();
    assert!(
        matches!(err, RuntimeError::ScopeSlotConflict { first: 0, second: 1, window: 2 }),
        "{err}"
    );

    executor.set_max_parallel_timesteps(1);
    executor.run(2)?;
    assert_eq!(tensor(&slot, "b")?.to_vec::<f32>()?, vec![2.0]);
    assert_eq!(
        tensor(&slot, "timestep")?.scalar_value::<i32>()?,
        1,
        "the shared slot ends on the last timestep"
    );
    Ok(())
}

#[test]
fn recurrent_mapping_pairs_adjacent_offsets() {
    let link = |internal: &str, offset: i32| Link {
        internal: internal.into(),
        external: "H".into(),
        offset,
        window: 1,
    };
    let links = vec![link("h_prev", -1), link("h", 0)];
    let forward = recurrent_mapping(&links, false);
    assert_eq!(forward.get("h").map(String::as_str), Some("h_prev"));
    assert_eq!(forward.len(), 1);
}

#[test]
fn step_scopes_grow_but_never_shrink() -> Result<()> {
    let outer = scope_with(RuntimeConfig::default())?;
    let scopes = StepScopes::default();
    assert!(scopes.is_empty());
    let shared = scopes.shared_scope(&outer);
    assert!(Arc::ptr_eq(&shared, &scopes.shared_scope(&outer)));

    scopes.ensure_len(3);
    assert_eq!(scopes.len(), 3);
    assert!(scopes.get(2).is_none());
    let third = scopes.step_scope(2, &shared);
    assert!(Arc::ptr_eq(&third, &scopes.step_scope(2, &shared)));
    assert!(Arc::ptr_eq(&third.parent().expect("parent"), &shared));

    scopes.ensure_len(1);
    assert_eq!(scopes.len(), 3);
    Ok(())
}

#[test]
fn gradients_accumulate_into_the_shifted_row() -> Result<()> {
    let scope = scope_with(RuntimeConfig::default())?;
    feed(&scope, "grad", &[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    feed(&scope, "acc", &[4, 2], vec![10.0; 8])?;
    scope
        .create_blob("timestep")
        .set_tensor(Tensor::from_vec([1], vec![1i32])?);
    let record = OperatorRecord::new("AccumulateInputGradient")
        .input("timestep")
        .input("grad")
        .input("acc")
        .output("acc")
        .arg("offset", 1i64);
    scope.run_operator_once(record.clone())?;
    assert_eq!(
        tensor(&scope, "acc")?.to_vec::<f32>()?,
        vec![10.0, 10.0, 10.0, 10.0, 13.0, 14.0, 10.0, 10.0]
    );

    let mut not_in_place = record;
    not_in_place.outputs = vec!["other".to_string()];
    let err = scope.run_operator_once(not_in_place).unwrap_err();
    assert!(matches!(err, RuntimeError::SchemaViolation { .. }), "{err}");
    Ok(())
}
