use std::sync::Arc;

use anyhow::Result;
use blobnet::{
    builder, DeviceOption, DeviceType, EnginePreferences, GraphRecord, OpSchema, Operator,
    OperatorBase, OperatorBuilder, OperatorContext, OperatorRecord, Runtime, RuntimeBuilder,
    RuntimeConfig, RuntimeError, Scope, Tensor,
};

/// Writes a one-element tensor holding `mark` into its first output.
struct Probe {
    base: OperatorBase,
    mark: f32,
}

impl Operator for Probe {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> blobnet::Result<()> {
        self.base.output(0).set_tensor(Tensor::scalar(self.mark));
        Ok(())
    }
}

fn probe(mark: f32) -> OperatorBuilder {
    builder(move |ctx: OperatorContext<'_>| {
        Ok(Box::new(Probe {
            base: OperatorBase::new(&ctx)?,
            mark,
        }) as Box<dyn Operator>)
    })
}

fn declines() -> OperatorBuilder {
    builder(|ctx: OperatorContext<'_>| {
        Err(RuntimeError::unsupported(
            ctx.record.op_type.clone(),
            "only handles even batch sizes",
        ))
    })
}

fn probe_runtime(configure: impl FnOnce(&mut RuntimeBuilder) -> blobnet::Result<()>) -> Result<Arc<Scope>> {
    let mut runtime = Runtime::builder();
    runtime.register_operator(DeviceType::CPU, "Probe", probe(0.0))?;
    runtime.register_schema(OpSchema::new("Probe").inputs_between(0, 1).num_outputs(1));
    configure(&mut runtime)?;
    Ok(runtime.build()?.root_scope())
}

fn create(scope: &Arc<Scope>, record: OperatorRecord) -> blobnet::Result<Box<dyn Operator>> {
    scope
        .runtime()
        .factory()
        .create_operator(Arc::new(record), scope, None)
}

fn mark_of(scope: &Scope, blob: &str) -> Result<f32> {
    let blob = scope.get_blob(blob).expect("output exists");
    Ok(blob.require_tensor("out")?.scalar_value::<f32>()?)
}

#[test]
fn missing_engine_falls_back_to_default_implementation() -> Result<()> {
    let scope = probe_runtime(|_| Ok(()))?;
    let mut op = create(&scope, OperatorRecord::new("Probe").output("out").with_engine("FAST"))?;
    assert_eq!(op.base().engine(), "");
    op.run()?;
    assert_eq!(mark_of(&scope, "out")?, 0.0);
    Ok(())
}

#[test]
fn explicit_engine_list_is_tried_in_order() -> Result<()> {
    let scope = probe_runtime(|runtime| {
        runtime.register_engine(DeviceType::CPU, "Probe", "FAST", probe(1.0))?;
        runtime.register_engine(DeviceType::CPU, "Probe", "SLOW", probe(2.0))?;
        Ok(())
    })?;
    let mut op = create(
        &scope,
        OperatorRecord::new("Probe")
            .output("out")
            .with_engine("MISSING,SLOW,FAST"),
    )?;
    assert_eq!(op.base().engine(), "SLOW");
    op.run()?;
    assert_eq!(mark_of(&scope, "out")?, 2.0);
    Ok(())
}

#[test]
fn unsupported_feature_moves_on_to_the_next_candidate() -> Result<()> {
    let scope = probe_runtime(|runtime| {
        runtime.register_engine(DeviceType::CPU, "Probe", "PICKY", declines())?;
        runtime.register_engine(DeviceType::CPU, "Probe", "FAST", probe(1.0))?;
        Ok(())
    })?;
    let op = create(
        &scope,
        OperatorRecord::new("Probe").output("out").with_engine("PICKY,FAST"),
    )?;
    assert_eq!(op.base().engine(), "FAST");

    let op = create(&scope, OperatorRecord::new("Probe").output("out").with_engine("PICKY"))?;
    assert_eq!(op.base().engine(), "");
    Ok(())
}

#[test]
fn other_construction_errors_abort_resolution() -> Result<()> {
    let scope = probe_runtime(|runtime| {
        runtime.register_engine(
            DeviceType::CPU,
            "Probe",
            "BROKEN",
            builder(|_| Err(RuntimeError::invalid_argument("alpha", "must be positive"))),
        )?;
        Ok(())
    })?;
    let err = create(&scope, OperatorRecord::new("Probe").output("out").with_engine("BROKEN"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { ref name, .. } if name == "alpha"));
    Ok(())
}

#[test]
fn preferences_apply_after_record_engines() -> Result<()> {
    let mut runtime = Runtime::builder().with_preferences(
        EnginePreferences::new()
            .prefer_for_op(DeviceType::CPU, "Probe", ["SLOW"])
            .prefer_for_device(DeviceType::CPU, ["FAST"]),
    );
    runtime.register_operator(DeviceType::CPU, "Probe", probe(0.0))?;
    runtime.register_engine(DeviceType::CPU, "Probe", "FAST", probe(1.0))?;
    runtime.register_engine(DeviceType::CPU, "Probe", "SLOW", probe(2.0))?;
    let scope = runtime.build()?.root_scope();

    let op = create(&scope, OperatorRecord::new("Probe").output("out"))?;
    assert_eq!(op.base().engine(), "SLOW");
    let op = create(&scope, OperatorRecord::new("Probe").output("out").with_engine("FAST"))?;
    assert_eq!(op.base().engine(), "FAST");

    let candidates = scope
        .runtime()
        .factory()
        .candidate_engines(&OperatorRecord::new("Probe").with_engine("X"));
    assert_eq!(candidates, vec!["X", "SLOW", "FAST"]);
    Ok(())
}

#[test]
fn implicit_preferences_can_be_disabled() -> Result<()> {
    let mut runtime = Runtime::builder()
        .with_config(RuntimeConfig {
            disable_implicit_engine_preference: true,
            ..RuntimeConfig::default()
        })
        .with_preferences(EnginePreferences::new().prefer_for_device(DeviceType::CPU, ["FAST"]));
    runtime.register_operator(DeviceType::CPU, "Probe", probe(0.0))?;
    runtime.register_engine(DeviceType::CPU, "Probe", "FAST", probe(1.0))?;
    let scope = runtime.build()?.root_scope();

    let op = create(&scope, OperatorRecord::new("Probe").output("out"))?;
    assert_eq!(op.base().engine(), "");
    Ok(())
}

#[test]
fn stamped_engine_names_are_truncated() -> Result<()> {
    let scope = probe_runtime(|runtime| {
        runtime.register_engine(DeviceType::CPU, "Probe", "CUSTOMIZED_KERNEL", probe(3.0))?;
        Ok(())
    })?;
    let op = create(
        &scope,
        OperatorRecord::new("Probe").output("out").with_engine("CUSTOMIZED_KERNEL"),
    )?;
    assert_eq!(op.base().engine(), "CUSTOMIZED");
    Ok(())
}

#[test]
fn invalid_preferences_are_rejected_at_build() -> Result<()> {
    let mut runtime = Runtime::builder()
        .with_preferences(EnginePreferences::new().prefer_for_op(DeviceType::CPU, "Nope", ["FAST"]));
    runtime.register_operator(DeviceType::CPU, "Probe", probe(0.0))?;
    let err = runtime.build().unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidEnginePreference(_)), "{err}");

    let runtime = Runtime::builder()
        .with_preferences(EnginePreferences::new().prefer_for_device(DeviceType::GPU, ["CUDNN"]));
    let err = runtime.build().unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownDeviceType(DeviceType::GPU)), "{err}");
    Ok(())
}

#[test]
fn preferences_deserialize_from_json() -> Result<()> {
    let prefs: EnginePreferences = serde_json::from_str(
        r#"{ "per_op": { "0": { "Probe": ["FAST"] } }, "global": { "0": ["SLOW"] } }"#,
    )?;
    assert_eq!(prefs.per_op(DeviceType::CPU, "Probe"), ["FAST".to_string()]);
    assert_eq!(prefs.global(DeviceType::CPU), ["SLOW".to_string()]);
    Ok(())
}

#[test]
fn unregistered_device_and_missing_operator_are_distinct_errors() -> Result<()> {
    let scope = probe_runtime(|runtime| {
        runtime.register_device(DeviceType(7));
        Ok(())
    })?;
    let on_gpu = OperatorRecord::new("Probe")
        .output("out")
        .with_device(DeviceOption::new(DeviceType::GPU));
    let err = create(&scope, on_gpu).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownDeviceType(DeviceType::GPU)), "{err}");

    let on_custom = OperatorRecord::new("Probe")
        .output("out")
        .with_device(DeviceOption::new(DeviceType(7)));
    let err = create(&scope, on_custom).unwrap_err();
    assert!(matches!(err, RuntimeError::OperatorNotFound { .. }), "{err}");
    assert!(err.to_string().contains("device(7)"), "{err}");
    Ok(())
}

#[test]
fn schema_failures_happen_before_any_blob_is_created() -> Result<()> {
    let scope = probe_runtime(|_| Ok(()))?;
    let err = create(
        &scope,
        OperatorRecord::new("Probe").output("first").output("second"),
    )
    .unwrap_err();
    assert!(matches!(err, RuntimeError::SchemaViolation { .. }), "{err}");
    assert!(!scope.has_blob("first"));
    assert!(!scope.has_blob("second"));
    Ok(())
}

#[test]
fn missing_inputs_fail_construction() -> Result<()> {
    let scope = probe_runtime(|_| Ok(()))?;
    let err = create(&scope, OperatorRecord::new("Probe").input("absent").output("out")).unwrap_err();
    assert!(matches!(err, RuntimeError::MissingInput { ref blob, .. } if blob == "absent"));
    Ok(())
}

#[test]
fn graph_positions_are_stamped_and_failures_recorded() -> Result<()> {
    let scope = probe_runtime(|_| Ok(()))?;
    assert_eq!(scope.last_failed_op_position(), None);

    let broken = GraphRecord::new("broken")
        .op(OperatorRecord::new("Probe").output("a"))
        .op(OperatorRecord::new("Probe").output("b"))
        .op(OperatorRecord::new("Unregistered").output("c"));
    let err = scope.create_graph(broken, false).unwrap_err();
    assert!(
        matches!(err.graph_construction_cause(), Some(RuntimeError::OperatorNotFound { .. })),
        "{err}"
    );
    assert_eq!(scope.last_failed_op_position(), Some(2));
    assert!(!scope.has_graph("broken"));

    let fine = GraphRecord::new("fine")
        .op(OperatorRecord::new("Probe").output("a"))
        .op(OperatorRecord::new("Probe").output("b"));
    let handle = scope.create_graph(fine, false)?;
    let graph = handle.lock().expect("graph poisoned");
    assert_eq!(graph.record().ops.len(), 2);
    Ok(())
}
